//! Guest side of the host↔guest transport.
//!
//! The agent listens on the vsock agent port. The host probes the socket
//! while the VM boots, so the first connections may close before a task
//! arrives — the handshake treats a premature close as a probe and simply
//! re-accepts, forever.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use marathon_proto::{AGENT_PORT, HEADER_LEN, Header, Message, TaskSpec, tag};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use tracing::{debug, warn};

/// `IOCTL_VM_SOCKETS_GET_LOCAL_CID` from `linux/vm_sockets.h`.
const VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x7b9;

/// Binds the agent listener on the vsock agent port.
pub fn bind() -> io::Result<VsockListener> {
    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, AGENT_PORT);
    VsockListener::bind(addr)
}

/// Reads this guest's context id from `/dev/vsock`.
///
/// Falls back to 0 when the device or ioctl is unavailable; the host only
/// uses the value for logging and correlation.
pub fn local_cid() -> u32 {
    fn query() -> io::Result<u32> {
        let dev = std::fs::File::open("/dev/vsock")?;
        let mut cid: u32 = 0;
        // SAFETY: fd is valid for the lifetime of `dev`; the ioctl writes a u32.
        let ret = unsafe {
            libc::ioctl(
                dev.as_raw_fd(),
                VM_SOCKETS_GET_LOCAL_CID,
                std::ptr::from_mut(&mut cid),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(cid)
    }
    query().unwrap_or_else(|e| {
        warn!(error = %e, "could not read local CID");
        0
    })
}

/// Accepts connections until one delivers a task.
///
/// Each accepted connection goes through the READY / TASK_START handshake;
/// probe connections are dropped and the loop re-accepts indefinitely.
pub async fn accept_task(listener: &mut VsockListener, cid: u32) -> io::Result<(VsockStream, TaskSpec)> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!(?peer, "host connected");
        match handshake(&mut stream, cid).await {
            Ok(Some(spec)) => return Ok((stream, spec)),
            Ok(None) => debug!("host probe, re-accepting"),
            Err(e) => {
                warn!(error = %e, "handshake failed, re-accepting");
            }
        }
    }
}

/// Sends `READY` and waits for `TASK_START` on one connection.
///
/// Returns `Ok(None)` when the connection dies before a task arrives (a
/// host probe). Any frame other than `TASK_START` is a protocol error.
pub(crate) async fn handshake<S>(stream: &mut S, cid: u32) -> io::Result<Option<TaskSpec>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = marathon_proto::send(stream, 0, &Message::Ready { vm_id: cid }).await {
        return if probe_close(&e) { Ok(None) } else { Err(e) };
    }

    match marathon_proto::recv(stream).await {
        Ok((_, Message::TaskStart(spec))) => Ok(Some(spec)),
        Ok((_, other)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected TASK_START, got tag {:#04x}", other.tag()),
        )),
        Err(e) if probe_close(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Errors produced when the host closes a probe connection.
fn probe_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

/// Non-blocking, non-consuming check for a pending `CANCEL` frame.
///
/// Peeks exactly the frame header; whatever is found stays in the socket
/// buffer. Returns `false` when nothing (or only a partial header) is
/// readable.
pub fn cancel_pending(fd: RawFd) -> io::Result<bool> {
    let mut header = [0u8; HEADER_LEN];
    // SAFETY: buffer is valid for HEADER_LEN bytes; MSG_PEEK leaves the
    // stream untouched.
    let n = unsafe {
        libc::recv(
            fd,
            header.as_mut_ptr().cast(),
            HEADER_LEN,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        let e = io::Error::last_os_error();
        return match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
            _ => Err(e),
        };
    }
    #[allow(clippy::cast_sign_loss)]
    let read = n as usize;
    if read == HEADER_LEN {
        Ok(Header::parse(&header).msg_type == tag::CANCEL)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use marathon_proto::Credentials;
    use marathon_proto::TaskId;

    use super::*;

    fn spec() -> TaskSpec {
        TaskSpec {
            task_id: TaskId::generate(),
            repo_url: "https://forge.test/o/r.git".into(),
            branch: "main".into(),
            prompt: "p".into(),
            credentials: Credentials {
                token: "t".into(),
                forge_host: "forge.test".into(),
            },
            create_artifact: false,
            artifact_title: None,
            artifact_body: None,
            completion_promise: None,
            max_iterations: 1,
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn handshake_delivers_task() {
        let (mut guest, mut host) = tokio::io::duplex(8192);
        let task_spec = spec();

        let host_side = {
            let task_spec = task_spec.clone();
            async move {
                let (_, msg) = marathon_proto::recv(&mut host).await.unwrap();
                assert_eq!(msg, Message::Ready { vm_id: 7 });
                marathon_proto::send(&mut host, 0, &Message::TaskStart(task_spec))
                    .await
                    .unwrap();
            }
        };

        let (result, ()) = tokio::join!(handshake(&mut guest, 7), host_side);
        assert_eq!(result.unwrap(), Some(task_spec));
    }

    #[tokio::test]
    async fn premature_close_is_a_probe() {
        let (mut guest, host) = tokio::io::duplex(8192);
        drop(host);
        let result = handshake(&mut guest, 7).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wrong_first_frame_is_an_error() {
        let (mut guest, mut host) = tokio::io::duplex(8192);
        let host_side = async move {
            let _ = marathon_proto::recv(&mut host).await.unwrap();
            marathon_proto::send(&mut host, 0, &Message::Cancel)
                .await
                .unwrap();
        };
        let (result, ()) = tokio::join!(handshake(&mut guest, 7), host_side);
        assert!(result.is_err());
    }

    #[test]
    fn cancel_peek_detects_and_preserves() {
        use std::io::{Read, Write};
        use std::os::unix::net::UnixStream;

        let (mut host, guest) = UnixStream::pair().unwrap();

        // Nothing pending.
        assert!(!cancel_pending(guest.as_raw_fd()).unwrap());

        // A CANCEL frame is pending.
        let frame = marathon_proto::encode_frame(0, &Message::Cancel);
        host.write_all(&frame).unwrap();
        host.flush().unwrap();
        assert!(cancel_pending(guest.as_raw_fd()).unwrap());

        // The peek consumed nothing: the full frame is still readable.
        let mut guest_blocking = guest;
        let mut read_back = vec![0u8; frame.len()];
        guest_blocking.read_exact(&mut read_back).unwrap();
        assert_eq!(read_back, frame);
    }

    #[test]
    fn non_cancel_frame_is_not_a_cancel() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let (mut host, guest) = UnixStream::pair().unwrap();
        let frame = marathon_proto::encode_frame(
            0,
            &Message::Progress {
                iteration: 1,
                max_iterations: 2,
                status: "running".into(),
            },
        );
        host.write_all(&frame).unwrap();
        assert!(!cancel_pending(guest.as_raw_fd()).unwrap());
    }
}
