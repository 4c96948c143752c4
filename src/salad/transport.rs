//! Console transports: serial devices and Unix sockets.
//!
//! Every transport gets a reader feeding [`TransportEvent`]s into the
//! multiplexer and a writer draining an input channel. Dropping the
//! [`TransportHandle`] stops both.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use bytes::Bytes;
use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CONSOLE_QUEUE_DEPTH;

/// Size of a single read from a console.
const READ_CHUNK: usize = 4096;

/// Serial reads return at least every this many tenths of a second, so the
/// reader notices when it is asked to stop.
const SERIAL_READ_TIMEOUT_DECISECONDS: u8 = 5;

#[derive(Debug)]
pub enum TransportEventKind {
    Data(Bytes),
    Closed,
}

/// Something that happened on a transport.
#[derive(Debug)]
pub struct TransportEvent {
    /// Identifies which opening of the transport produced the event.
    pub id: u64,
    pub kind: TransportEventKind,
}

pub type EventSender = mpsc::Sender<TransportEvent>;

/// An open transport.
pub struct TransportHandle {
    id: u64,
    name: String,
    writer: mpsc::Sender<Bytes>,
    stop: CancellationToken,
}

impl TransportHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sender writing to the transport.
    pub fn writer(&self) -> mpsc::Sender<Bytes> {
        self.writer.clone()
    }

    /// Queues `data` for the console, dropping it if the writer is behind.
    pub fn write(&self, data: Bytes) {
        match self.writer.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{}: writer is stalled, dropping input", self.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{}: writer is gone", self.name);
            }
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn baud_rate(baud: u32) -> std::io::Result<BaudRate> {
    Ok(match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", other),
            ));
        }
    })
}

/// Puts a tty in raw mode with a bounded read timeout.
fn configure_tty(file: &File, baud: u32) -> std::io::Result<()> {
    let mut attrs = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, baud_rate(baud)?)?;
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = SERIAL_READ_TIMEOUT_DECISECONDS;
    termios::tcsetattr(file, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

/// Opens a serial device.
///
/// Serial I/O is blocking, so the reader and the writer each get a thread.
pub fn open_serial(
    id: u64,
    path: &Path,
    baud: u32,
    events: EventSender,
) -> std::io::Result<TransportHandle> {
    let name = format!("serial:{}", path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)?;
    configure_tty(&file, baud)?;

    let mut reader = file.try_clone()?;
    let mut writer = file;
    let stop = CancellationToken::new();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(CONSOLE_QUEUE_DEPTH);

    let token = stop.clone();
    let reader_name = name.clone();
    std::thread::Builder::new()
        .name(format!("salad-rx-{}", id))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            while !token.is_cancelled() {
                match reader.read(&mut buf) {
                    // Read timeout
                    Ok(0) => continue,
                    Ok(n) => {
                        let event = TransportEvent {
                            id,
                            kind: TransportEventKind::Data(Bytes::copy_from_slice(&buf[..n])),
                        };
                        if events.blocking_send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("{}: read failed: {}", reader_name, e);
                        break;
                    }
                }
            }
            let _ = events.blocking_send(TransportEvent {
                id,
                kind: TransportEventKind::Closed,
            });
        })?;

    let writer_name = name.clone();
    std::thread::Builder::new()
        .name(format!("salad-tx-{}", id))
        .spawn(move || {
            while let Some(data) = writer_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!("{}: write failed: {}", writer_name, e);
                    break;
                }
            }
        })?;

    Ok(TransportHandle {
        id,
        name,
        writer: writer_tx,
        stop,
    })
}

/// Connects to the console socket of an emulated machine.
pub async fn open_unix(id: u64, path: &Path, events: EventSender) -> std::io::Result<TransportHandle> {
    let name = format!("unix:{}", path.display());
    let stream = UnixStream::connect(path).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let stop = CancellationToken::new();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(CONSOLE_QUEUE_DEPTH);

    let token = stop.clone();
    let reader_name = name.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    debug!("{}: closed by peer", reader_name);
                    break;
                }
                Ok(n) => {
                    let event = TransportEvent {
                        id,
                        kind: TransportEventKind::Data(Bytes::copy_from_slice(&buf[..n])),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("{}: read failed: {}", reader_name, e);
                    break;
                }
            }
        }
        let _ = events
            .send(TransportEvent {
                id,
                kind: TransportEventKind::Closed,
            })
            .await;
    });

    let token = stop.clone();
    let writer_name = name.clone();
    tokio::spawn(async move {
        loop {
            let data = tokio::select! {
                _ = token.cancelled() => break,
                data = writer_rx.recv() => data,
            };
            let Some(data) = data else { break };
            if let Err(e) = write_half.write_all(&data).await {
                warn!("{}: write failed: {}", writer_name, e);
                break;
            }
        }
    });

    Ok(TransportHandle {
        id,
        name,
        writer: writer_tx,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_supported_baud_rates() {
        assert!(baud_rate(115_200).is_ok());
        assert!(baud_rate(12_345).is_err());
    }

    #[tokio::test]
    async fn test_unix_transport_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dut.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(CONSOLE_QUEUE_DEPTH);
        let handle = open_unix(7, &path, events_tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(handle.name(), format!("unix:{}", path.display()));

        peer.write_all(b"boot\n").await.unwrap();
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.id, 7);
        assert!(matches!(event.kind, TransportEventKind::Data(ref d) if &d[..] == b"boot\n"));

        handle.write(Bytes::from_static(b"input"));
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"input");

        drop(peer);
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.kind, TransportEventKind::Closed));
    }
}
