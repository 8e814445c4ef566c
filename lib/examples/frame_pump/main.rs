use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bufferqueue::memory::{BufferAllocator, BufferUsage, HeapAllocator};
use bufferqueue::{
    BufferQueue, Consumer, ConsumerListener, DequeueFlags, NativeWindowApi, PixelFormat, Producer,
    QueueBufferInput, QueueConfig, QueueError, NUM_BUFFER_SLOTS,
};
use bufferqueue_utils::framegen::FrameGenerator;
use bufferqueue_utils::memfd::MemfdAllocator;
use bufferqueue_utils::PixelAccess;

use anyhow::{anyhow, Context};
use clap::{App, Arg};
use log::{debug, warn};

enum Event {
    FrameAvailable,
    ProducerDisconnected,
}

struct EventListener(Sender<Event>);

impl ConsumerListener for EventListener {
    fn on_frame_available(&self) {
        let _ = self.0.send(Event::FrameAvailable);
    }

    fn on_producer_disconnected(&self) {
        let _ = self.0.send(Event::ProducerDisconnected);
    }
}

struct Params {
    width: u32,
    height: u32,
    format: PixelFormat,
    stop_after: Option<usize>,
    config: QueueConfig,
}

fn main() {
    env_logger::init();

    let matches = App::new("Buffer queue frame pump")
        .arg(
            Arg::with_name("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after producing a given number of frames"),
        )
        .arg(
            Arg::with_name("frame_size")
                .long("frame_size")
                .required(false)
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to produce (e.g. \"640x480\")"),
        )
        .arg(
            Arg::with_name("format")
                .long("format")
                .required(false)
                .takes_value(true)
                .default_value("rgba")
                .help("Pixel format of the frames (rgba, rgbx, bgra or rgb)"),
        )
        .arg(
            Arg::with_name("buffers")
                .long("buffers")
                .required(false)
                .takes_value(true)
                .default_value("3")
                .help("Number of buffer slots used by the queue"),
        )
        .arg(
            Arg::with_name("memory")
                .long("memory")
                .required(false)
                .takes_value(true)
                .default_value("heap")
                .help("Type of memory backing the buffers (heap or memfd)"),
        )
        .arg(
            Arg::with_name("synchronous")
                .long("sync")
                .help("Block the producer instead of dropping frames"),
        )
        .get_matches();

    let stop_after = match clap::value_t!(matches.value_of("num_frames"), usize) {
        Ok(v) => Some(v),
        Err(e) if e.kind == clap::ErrorKind::ArgumentNotFound => None,
        Err(e) => panic!("Invalid value for stop_after: {}", e),
    };

    let (width, height) = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: u32 = split[0].parse().expect(ERROR_MSG);
            let height: u32 = split[1].parse().expect(ERROR_MSG);

            (width, height)
        })
        .unwrap();

    let format = match matches.value_of("format") {
        Some("rgba") => PixelFormat::RGBA_8888,
        Some("rgbx") => PixelFormat::RGBX_8888,
        Some("bgra") => PixelFormat::BGRA_8888,
        Some("rgb") => PixelFormat::RGB_888,
        _ => panic!("Invalid value for format"),
    };

    let buffer_count = clap::value_t!(matches.value_of("buffers"), usize)
        .ok()
        .filter(|&n| n >= 2 && n <= NUM_BUFFER_SLOTS)
        .expect("Invalid value for buffers");

    let mut config = QueueConfig::new()
        .name("frame_pump")
        .buffer_count(buffer_count)
        .default_size(width, height)
        .default_format(format)
        .consumer_usage(BufferUsage::SW_READ_OFTEN);
    if matches.is_present("synchronous") {
        config = config.synchronous();
    }

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let params = Params {
        width,
        height,
        format,
        stop_after,
        config,
    };

    let res = match matches.value_of("memory") {
        Some("heap") => run(HeapAllocator::new(), params, lets_quit),
        Some("memfd") => run(MemfdAllocator::new(), params, lets_quit),
        _ => panic!("Invalid value for memory"),
    };

    // Insert new line since we were overwriting the same one
    println!();

    if let Err(e) = res {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run<A>(allocator: A, params: Params, lets_quit: Arc<AtomicBool>) -> anyhow::Result<()>
where
    A: BufferAllocator,
    A::Buffer: PixelAccess,
{
    let queue = Arc::new(BufferQueue::new(allocator, params.config)?);
    let (event_tx, event_rx) = mpsc::channel();
    let listener: Arc<dyn ConsumerListener> = Arc::new(EventListener(event_tx));
    queue.set_listener(Some(listener));

    let producer = {
        let queue = Arc::clone(&queue);
        let lets_quit = Arc::clone(&lets_quit);
        thread::spawn(move || {
            produce(
                &*queue,
                params.width,
                params.height,
                params.format,
                params.stop_after,
                &lets_quit,
            )
        })
    };

    let start_time = Instant::now();
    let mut frame_counter = 0usize;
    let mut dropped = 0u64;
    let mut last_frame_number = 0u64;
    let mut pixels = vec![0u8; 4];

    loop {
        if lets_quit.load(Ordering::SeqCst) {
            // Wakes up the producer if it is blocked in dequeue.
            queue.abandon();
            break;
        }

        match event_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::FrameAvailable) => (),
            Ok(Event::ProducerDisconnected) => break,
            Err(RecvTimeoutError::Timeout) if producer.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Some(item) = queue.acquire_next()? {
            item.buffer.read_pixels(&mut pixels)?;
            if item.frame_number != last_frame_number + 1 {
                dropped += item.frame_number - last_frame_number - 1;
            }
            last_frame_number = item.frame_number;
            frame_counter += 1;

            let elapsed = start_time.elapsed();
            let fps = frame_counter as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
            print!(
                "\rFrame {:#6} (slot {:#2}, pixel {:02x?}) dropped: {:#5} fps: {:#7.2}",
                item.frame_number, item.slot, pixels, dropped, fps,
            );
            io::stdout().flush()?;
        }
    }

    match producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))?
    {
        // The queue has been abandoned under the producer's feet.
        Err(e) if matches!(
            e.downcast_ref::<QueueError>(),
            Some(QueueError::NotInitialized(_))
        ) => {}
        res => res?,
    }

    debug!("{}", queue.dump());

    Ok(())
}

fn produce<A>(
    queue: &BufferQueue<A>,
    width: u32,
    height: u32,
    format: PixelFormat,
    stop_after: Option<usize>,
    lets_quit: &AtomicBool,
) -> anyhow::Result<()>
where
    A: BufferAllocator,
    A::Buffer: PixelAccess,
{
    let mut frame_gen =
        FrameGenerator::new(width, height, format).context("Failed to create frame generator")?;
    let mut frame = vec![0u8; frame_gen.frame_size()];
    let mut buffers = vec![None; NUM_BUFFER_SLOTS];
    let start_time = Instant::now();

    queue.connect(NativeWindowApi::Cpu)?;

    let mut produced = 0usize;
    while !lets_quit.load(Ordering::SeqCst) && stop_after.map_or(true, |n| produced < n) {
        let dequeued = match queue.dequeue(width, height, format, BufferUsage::SW_WRITE_OFTEN) {
            Ok(dequeued) => dequeued,
            Err(QueueError::NotInitialized(reason)) => {
                debug!("Stopping producer: {}", reason);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if dequeued.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS) {
            buffers.iter_mut().for_each(|b| *b = None);
        }
        if dequeued.flags.contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION)
            || buffers[dequeued.slot].is_none()
        {
            buffers[dequeued.slot] = Some(queue.request_buffer(dequeued.slot)?);
        }
        if let Some(fence) = dequeued.fence {
            fence.wait(Some(Duration::from_secs(1)))?;
        }

        frame_gen.next_frame(&mut frame)?;
        match &buffers[dequeued.slot] {
            Some(buffer) => buffer.write_pixels(&frame)?,
            None => warn!("No buffer cached for slot {}", dequeued.slot),
        }

        let timestamp = start_time.elapsed().as_nanos() as i64;
        queue.queue(dequeued.slot, QueueBufferInput::new(timestamp))?;
        produced += 1;
    }

    queue.disconnect(NativeWindowApi::Cpu)?;

    Ok(())
}
