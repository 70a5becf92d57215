//! Client-side request submission and reply rendering.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tabwriter::TabWriter;

use crate::protocol::{self, Request, WorkerRecord};

/// `sockaddr_un` path capacity; longer socket overrides cannot be
/// represented and are rejected before connecting.
pub const MAX_SOCKET_PATH: usize = 108;

pub fn connect(socket: &Path) -> Result<UnixStream> {
    if socket.as_os_str().len() >= MAX_SOCKET_PATH {
        bail!(
            "socket path {:?} is longer than the {} byte limit",
            socket,
            MAX_SOCKET_PATH
        );
    }
    UnixStream::connect(socket)
        .with_context(|| format!("failed to connect to the runns daemon at {:?}", socket))
}

pub fn submit(stream: &mut UnixStream, request: &Request) -> Result<()> {
    request
        .write_to(stream)
        .context("failed to send the request to the daemon")
}

pub fn fetch_list(stream: &mut UnixStream) -> Result<Vec<WorkerRecord>> {
    protocol::read_list_reply(stream).context("failed to read the worker list from the daemon")
}

pub fn render_list<W: io::Write>(writer: W, records: &[WorkerRecord]) -> Result<()> {
    let mut tab_writer = TabWriter::new(writer);
    writeln!(&mut tab_writer, "UID\tPID")?;
    for record in records {
        writeln!(&mut tab_writer, "{}\t{}", record.uid, record.pid)?;
    }
    tab_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        OpMode, Payload, RequestFlags, RequestHeader, TerminalMode,
    };

    use std::ffi::CString;
    use std::io::Read;
    use std::path::PathBuf;

    #[test]
    fn test_overlong_socket_path_is_rejected() {
        let path = PathBuf::from(format!("/tmp/{}", "x".repeat(MAX_SOCKET_PATH)));
        assert!(connect(&path).is_err());
    }

    #[test]
    fn test_submitted_request_decodes_on_the_other_end() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();

        let request = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(Payload {
                program: CString::new("/bin/echo").unwrap(),
                netns: CString::new("/var/run/netns/blue").unwrap(),
                args: vec![CString::new("hi").unwrap()],
                envs: vec![CString::new("LANG=C").unwrap()],
            }),
        };
        submit(&mut ours, &request).unwrap();
        drop(ours);

        let header = RequestHeader::read_from(&mut theirs).unwrap();
        let payload = Payload::read_from(&mut theirs, &header).unwrap();
        assert_eq!(payload, request.payload.unwrap());

        // The historical EOF marker trails the payload.
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, 0u32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_list_reply_over_a_socket() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();
        let records = vec![WorkerRecord { uid: 1000, pid: 7 }];
        protocol::write_list_reply(&mut theirs, &records).unwrap();
        drop(theirs);

        assert_eq!(fetch_list(&mut ours).unwrap(), records);
    }

    #[test]
    fn test_render_list_is_tabular() {
        let records = vec![
            WorkerRecord { uid: 1000, pid: 4242 },
            WorkerRecord { uid: 1000, pid: 17 },
        ];
        let mut out = Vec::new();
        render_list(&mut out, &records).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("UID"));
        assert!(text.contains("4242"));
        assert_eq!(text.lines().count(), 3);
    }
}
