use clap::Parser;
use hif_core::sim::{SimTarget, RAM_BASE_ADDRESS, RAM_SIZE};
use hif_core::{
    Buffer, Device, DeviceConfig, HifCallbacks, HifError, Request, RequestMode, Submitted,
};
use log::{debug, error, info};
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Bytes of target RAM each submitter owns.
const REGION_SIZE: u32 = 0x1000;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of concurrent submitters.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,
    /// Requests issued by every submitter.
    #[arg(short, long, default_value_t = 500)]
    requests: u32,
    /// Number of request descriptors.
    #[arg(short, long, default_value_t = 16)]
    capacity: usize,
    /// Largest number of requests executed per bus claim.
    #[arg(short, long)]
    batch: Option<NonZeroUsize>,
    /// Increase log verbosity (repeatable).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Identifies a request: the submitter and its sequence number.
type Tag = (usize, u32);

/// Checks that every submitter's asynchronous completions arrive in submission order.
struct Checker {
    next: Mutex<Vec<u32>>,
    completed: AtomicUsize,
    violations: AtomicUsize,
}

impl HifCallbacks<Tag> for Checker {
    fn on_async_complete(&self, (submitter, seq): Tag, _: Buffer, result: Result<usize, HifError>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = result {
            error!("Request {submitter}:{seq} failed: {e}");
            self.violations.fetch_add(1, Ordering::Relaxed);
        } else if seq < next[submitter] {
            error!(
                "Request {submitter}:{seq} completed after {submitter}:{}",
                next[submitter] - 1
            );
            self.violations.fetch_add(1, Ordering::Relaxed);
        }
        next[submitter] = seq + 1;
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(args.verbose as usize + 1)
        .modules([module_path!(), "hif_core"])
        .init()
        .unwrap();

    let regions = RAM_SIZE / REGION_SIZE as usize;
    if args.threads == 0 || args.threads > regions {
        error!("Thread count must be between 1 and {regions}");
        return ExitCode::FAILURE;
    }

    let failures = run(&args);
    if failures == 0 {
        info!("No violations");
        ExitCode::SUCCESS
    } else {
        error!("{failures} violations");
        ExitCode::FAILURE
    }
}

fn run(args: &Args) -> usize {
    let target = Arc::new(SimTarget::new());
    let config = DeviceConfig {
        pool_capacity: args.capacity,
        max_batch: args.batch,
        ..DeviceConfig::default()
    };
    let device = Arc::new(Device::<Tag>::new(target.clone(), config));
    if let Err(e) = device.start() {
        error!("Failed to start device: {e}");
        return 1;
    }
    let checker = Arc::new(Checker {
        next: Mutex::new(vec![0; args.threads]),
        completed: AtomicUsize::new(0),
        violations: AtomicUsize::new(0),
    });
    if let Err(e) = device.attach_notification_handlers(checker.clone()) {
        error!("Failed to attach handlers: {e}");
        return 1;
    }

    let start = Instant::now();
    let submitters: Vec<_> = (0..args.threads)
        .map(|submitter| {
            let device = Arc::clone(&device);
            let requests = args.requests;
            thread::spawn(move || submit_all(&device, submitter, requests))
        })
        .collect();
    let mut failures = 0;
    let mut async_issued = 0;
    for submitter in submitters {
        match submitter.join() {
            Ok((issued, failed)) => {
                async_issued += issued;
                failures += failed;
            }
            Err(_) => {
                error!("Submitter panicked");
                failures += 1;
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while checker.completed.load(Ordering::Relaxed) < async_issued && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    let completed = checker.completed.load(Ordering::Relaxed);
    if completed != async_issued {
        error!("{async_issued} asynchronous requests issued, {completed} completed");
        failures += 1;
    }
    failures += checker.violations.load(Ordering::Relaxed);
    info!(
        "{} requests in {:?}, {} bus claims",
        args.threads * args.requests as usize,
        start.elapsed(),
        target.claims()
    );

    failures += check_order(&target, args.threads);

    device.stop();
    if device.in_flight() != 0 {
        error!("{} descriptors still in use after stop", device.in_flight());
        failures += 1;
    }
    if target.claims() != target.releases() {
        error!(
            "Bus claimed {} times but released {} times",
            target.claims(),
            target.releases()
        );
        failures += 1;
    }
    failures
}

/// Issue `requests` writes into the submitter's own region, alternating synchronous and
/// asynchronous ones. Every write carries its sequence number.
///
/// Returns the number of asynchronous requests issued and the number of failures seen.
fn submit_all(device: &Device<Tag>, submitter: usize, requests: u32) -> (usize, usize) {
    let base = RAM_BASE_ADDRESS + submitter as u32 * REGION_SIZE;
    let slots = REGION_SIZE / 4;
    let mut async_issued = 0;
    let mut failures = 0;
    let mut retries = 0;

    for seq in 0..requests {
        let address = base + (seq % slots) * 4;
        let mode = if seq % 2 == 0 {
            RequestMode::WR_SYNC_BYTE_INC
        } else {
            RequestMode::WR_ASYNC_BYTE_INC
        };
        let mut buffer = Buffer::from(seq.to_le_bytes().to_vec());
        loop {
            let request = Request::new(address, buffer, mode, (submitter, seq));
            match device.submit(request) {
                Ok(Submitted::Complete { transferred: 4, .. }) => break,
                Ok(Submitted::Pending) => {
                    async_issued += 1;
                    break;
                }
                Ok(Submitted::Complete { transferred, .. }) => {
                    error!("Request {submitter}:{seq} transferred {transferred} bytes");
                    failures += 1;
                    break;
                }
                Err(e) if e.error == HifError::ResourceExhausted => {
                    retries += 1;
                    let Some(returned) = e.into_buffer() else {
                        unreachable!("a rejected request hands its buffer back")
                    };
                    buffer = returned;
                    thread::yield_now();
                }
                Err(e) => {
                    error!("Request {submitter}:{seq} failed: {e}");
                    failures += 1;
                    break;
                }
            }
        }
    }
    debug!("Submitter {submitter} done, {retries} retries on a full pool");
    (async_issued, failures)
}

/// Check that the target saw every submitter's writes in submission order, with nothing lost.
fn check_order(target: &SimTarget, submitters: usize) -> usize {
    let mut next = vec![0u32; submitters];
    let mut failures = 0;
    for transfer in target.transfers() {
        let Some(offset) = transfer.address.checked_sub(RAM_BASE_ADDRESS) else {
            continue;
        };
        let submitter = (offset / REGION_SIZE) as usize;
        let Ok(bytes) = <[u8; 4]>::try_from(transfer.data.as_slice()) else {
            error!("Transfer of {} bytes at {:#x}", transfer.data.len(), transfer.address);
            failures += 1;
            continue;
        };
        let seq = u32::from_le_bytes(bytes);
        if submitter >= submitters || seq != next[submitter] {
            error!("Submitter {submitter} wrote {seq} out of order");
            failures += 1;
        }
        if let Some(next) = next.get_mut(submitter) {
            *next = seq + 1;
        }
    }
    failures
}
