mod image;

use clap::Parser;
use hif_core::interrupt::{DsrContext, DsrStatus, HOST_INT_STATUS_MBOX0};
use hif_core::mailbox::MailboxId;
use hif_core::sim::{SimTarget, RAM_BASE_ADDRESS};
use hif_core::{
    Buffer, Device, DeviceConfig, HifCallbacks, HifError, Request, RequestMode, SetupError,
    SubmitError, Submitted,
};
use image::Segment;
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Treat the image as a raw binary instead of an ELF file.
    #[arg(long)]
    raw: bool,
    /// Load address of a raw image.
    #[arg(long, default_value_t = RAM_BASE_ADDRESS, value_parser = parse_address)]
    base: u32,
    /// Transfer whole blocks where possible instead of single bytes.
    #[arg(short, long)]
    block: bool,
    /// Largest transfer per request.
    #[arg(long, default_value_t = 4096)]
    chunk: usize,
    /// Message posted to mailbox 0 once the image is loaded.
    #[arg(short, long)]
    message: Option<String>,
    /// Increase log verbosity (repeatable).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Image to load into the target.
    image: String,
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse ELF: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("failed to start device: {0}")]
    Setup(#[from] SetupError),
    #[error("transfer at {address:#010x} failed: {source}")]
    Transfer {
        address: u32,
        #[source]
        source: SubmitError,
    },
    #[error("read back of {address:#010x} differs at byte {offset}")]
    Mismatch { address: u32, offset: usize },
    #[error("mailbox message was not delivered")]
    MessageLost,
    #[error("mailbox message is empty")]
    EmptyMessage,
}

fn main() -> ExitCode {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(args.verbose as usize + 1)
        .modules([module_path!(), "hif_core"])
        .init()
        .unwrap();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let message = args.message.as_deref().map(check_message).transpose()?;

    let mut buf = Vec::new();
    let mut file = File::open(&args.image)?;
    file.read_to_end(&mut buf)?;

    let segments = if args.raw {
        image::raw_segments(&buf, args.base)
    } else {
        image::elf_segments(&buf)?
    };

    let target = Arc::new(SimTarget::new());
    let device: Device<()> = Device::new(target.clone(), DeviceConfig::default());
    device.start()?;
    let chunk = args.chunk.clamp(1, device.config().bounce_size);

    for segment in &segments {
        info!(
            "Loading {} bytes at {:#010x}",
            segment.data.len(),
            segment.address
        );
        load(&device, segment, chunk, args.block)?;
        verify(&device, segment, chunk, args.block)?;
    }
    info!("Loaded and verified {} segments", segments.len());

    if let Some(message) = message {
        post(&device, &target, message)?;
    }

    echo(&device, &target);
    device.stop();
    Ok(())
}

/// Write `segment` in chunks, using block mode for the whole blocks of each chunk and byte mode
/// for what is left over.
fn load(
    device: &Device<()>,
    segment: &Segment<'_>,
    chunk: usize,
    block: bool,
) -> Result<(), CliError> {
    let mut offset = 0;
    while offset < segment.data.len() {
        let end = segment.data.len().min(offset + chunk);
        let address = segment.address + offset as u32;
        let mode = if block && end - offset >= device.config().block_size as usize {
            RequestMode::WR_SYNC_BLOCK_INC
        } else {
            RequestMode::WR_SYNC_BYTE_INC
        };
        let request = Request::write(address, &segment.data[offset..end], mode);
        let transferred = match device.submit(request) {
            Ok(Submitted::Complete { transferred, .. }) => transferred,
            Ok(Submitted::Pending) => unreachable!("synchronous requests complete in place"),
            Err(source) => return Err(CliError::Transfer { address, source }),
        };
        debug!("Wrote {transferred} bytes at {address:#010x}");
        offset += transferred;
    }
    Ok(())
}

fn verify(
    device: &Device<()>,
    segment: &Segment<'_>,
    chunk: usize,
    block: bool,
) -> Result<(), CliError> {
    let mut offset = 0;
    while offset < segment.data.len() {
        let len = (segment.data.len() - offset).min(chunk);
        let address = segment.address + offset as u32;
        let mode = if block && len >= device.config().block_size as usize {
            RequestMode::RD_SYNC_BLOCK_INC
        } else {
            RequestMode::RD_SYNC_BYTE_INC
        };
        let (buffer, transferred) = match device.submit(Request::read(address, len, mode)) {
            Ok(Submitted::Complete {
                buffer,
                transferred,
            }) => (buffer, transferred),
            Ok(Submitted::Pending) => unreachable!("synchronous requests complete in place"),
            Err(source) => return Err(CliError::Transfer { address, source }),
        };
        let expected = &segment.data[offset..offset + transferred];
        if let Some(at) = expected
            .iter()
            .zip(&buffer[..transferred])
            .position(|(a, b)| a != b)
        {
            return Err(CliError::Mismatch {
                address,
                offset: at,
            });
        }
        offset += transferred;
    }
    Ok(())
}

/// A mailbox message needs at least one byte to end on the mailbox's EOM address.
fn check_message(message: &str) -> Result<&[u8], CliError> {
    if message.is_empty() {
        return Err(CliError::EmptyMessage);
    }
    Ok(message.as_bytes())
}

/// Write `message` to mailbox 0 and check the target received it intact.
fn post(device: &Device<()>, target: &SimTarget, message: &[u8]) -> Result<(), CliError> {
    let address = device.config().mailboxes.window(MailboxId::MBOX0).start();
    let request = Request::write(address, message, RequestMode::WR_SYNC_BYTE_INC);
    if let Err(source) = device.submit(request) {
        return Err(CliError::Transfer { address, source });
    }
    let delivered = target.take_tx(MailboxId::MBOX0.index());
    if delivered.last().map(Vec::as_slice) != Some(message) {
        return Err(CliError::MessageLost);
    }
    info!("Posted {} byte message to mailbox 0", message.len());
    Ok(())
}

/// Reads mailbox 0 from the DSR, the way a network stack sitting on top would.
struct Echo {
    mailbox: u32,
    received: Mutex<Vec<u8>>,
}

impl HifCallbacks<()> for Echo {
    fn on_async_complete(&self, _: (), _: Buffer, result: Result<usize, HifError>) {
        if let Err(e) = result {
            warn!("Asynchronous request failed: {e}");
        }
    }

    fn dsr(&self, ctx: &mut DsrContext<'_>) -> DsrStatus {
        loop {
            match ctx.interrupt_status() {
                Ok(status) if status & HOST_INT_STATUS_MBOX0 != 0 => {}
                Ok(_) => return DsrStatus::Ok,
                Err(_) => return DsrStatus::Canceled,
            }
            match ctx.read(self.mailbox, 1, RequestMode::RD_SYNC_BYTE_FIX) {
                Ok(byte) => self
                    .received
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&byte),
                Err(_) => return DsrStatus::Canceled,
            }
        }
    }
}

/// Have the target send a reply and pick it up through the interrupt path.
fn echo(device: &Device<()>, target: &SimTarget) {
    let echo = Arc::new(Echo {
        mailbox: device.config().mailboxes.window(MailboxId::MBOX0).start(),
        received: Mutex::new(Vec::new()),
    });
    if let Err(e) = device.attach_notification_handlers(echo.clone()) {
        warn!("Could not attach handlers: {e}");
        return;
    }
    device.unmask_interrupts();

    let reply = b"ready";
    target.push_rx(MailboxId::MBOX0.index(), reply);
    device.notify_interrupt();
    if !device.wait_for_pending_interrupt() {
        warn!("Target reply was not drained");
    }
    device.mask_interrupts();
    device.detach();

    let received = echo.received.lock().unwrap_or_else(|e| e.into_inner());
    info!("Target replied {:?}", String::from_utf8_lossy(&received));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_is_refused_before_loading() {
        let args =
            Args::try_parse_from(["hif-cli", "--message", "", "does-not-exist.elf"]).unwrap();
        assert!(matches!(run(&args), Err(CliError::EmptyMessage)));

        let args = Args::try_parse_from(["hif-cli", "-m", "hi", "does-not-exist.elf"]).unwrap();
        assert!(matches!(run(&args), Err(CliError::Io(_))));
    }

    #[test]
    fn messages_are_sent_as_utf8() {
        assert_eq!(b"ping", check_message("ping").unwrap());
        assert_eq!("é".as_bytes(), check_message("é").unwrap());
    }
}
