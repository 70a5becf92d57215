//! Wire protocol spoken between runnsctl and the runns daemon.
//!
//! The protocol is local-only (an `AF_UNIX` stream socket), so all integers
//! travel in native endianness and machine word size. A request is a fixed
//! header followed, for launches, by a variable-length payload of
//! NUL-terminated strings.

use std::ffi::CString;
use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::slice;

use anyhow::{bail, Context, Result};
use bitflags::bitflags;

/// Default location of the daemon socket.
pub const DEFAULT_SOCKET: &str = "/var/run/runns/runns.socket";

/// Largest accepted path section in a request payload.
pub const MAX_PATH_SIZE: usize = libc::PATH_MAX as usize;
/// Largest accepted argument or environment vector.
pub const MAX_VEC_SIZE: usize = 4096;
/// Largest accepted single argument or environment record.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

bitflags! {
    /// Request flag word. STOP and LIST are commands to the daemon itself
    /// and carry no payload; NEW_PTY modifies a launch.
    pub struct RequestFlags: u32 {
        const STOP = 1 << 1;
        const LIST = 1 << 2;
        const NEW_PTY = 1 << 3;
    }
}

/// Client operation mode. The daemon decodes this for compatibility but does
/// not act on it; port forwarding is handled entirely client-side by the
/// bind-interposing loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Unknown,
    Netns,
    ForwardPort,
}

impl From<u32> for OpMode {
    fn from(raw: u32) -> Self {
        match raw {
            1 => OpMode::Netns,
            2 => OpMode::ForwardPort,
            _ => OpMode::Unknown,
        }
    }
}

impl OpMode {
    fn as_u32(self) -> u32 {
        match self {
            OpMode::Unknown => 0,
            OpMode::Netns => 1,
            OpMode::ForwardPort => 2,
        }
    }
}

/// Opaque terminal-mode blob. Captured by the client from its own terminal
/// and applied verbatim to a freshly allocated pty on the daemon side.
#[derive(Clone, Copy)]
pub struct TerminalMode(pub libc::termios);

impl TerminalMode {
    pub fn zeroed() -> Self {
        TerminalMode(unsafe { mem::zeroed() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                &self.0 as *const libc::termios as *const u8,
                mem::size_of::<libc::termios>(),
            )
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut mode = Self::zeroed();
        let buf = unsafe {
            slice::from_raw_parts_mut(
                &mut mode.0 as *mut libc::termios as *mut u8,
                mem::size_of::<libc::termios>(),
            )
        };
        reader
            .read_exact(buf)
            .context("short read in terminal mode")?;
        Ok(mode)
    }
}

impl fmt::Debug for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TerminalMode({} bytes)", self.as_bytes().len())
    }
}

impl PartialEq for TerminalMode {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Fixed-size request header. Read first and alone, so the daemon can
/// dispatch STOP and LIST without touching a payload that is not there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHeader {
    pub prog_sz: usize,
    pub netns_sz: usize,
    pub env_sz: usize,
    pub args_sz: usize,
    pub flags: RequestFlags,
    pub tmode: TerminalMode,
    pub op_mode: OpMode,
}

impl RequestHeader {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let prog_sz = read_word(reader)?;
        let netns_sz = read_word(reader)?;
        let env_sz = read_word(reader)?;
        let args_sz = read_word(reader)?;
        let flags = RequestFlags::from_bits_truncate(read_u32(reader)?);
        let tmode = TerminalMode::read_from(reader)?;
        let op_mode = OpMode::from(read_u32(reader)?);

        Ok(RequestHeader {
            prog_sz,
            netns_sz,
            env_sz,
            args_sz,
            flags,
            tmode,
            op_mode,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.prog_sz.to_ne_bytes())?;
        writer.write_all(&self.netns_sz.to_ne_bytes())?;
        writer.write_all(&self.env_sz.to_ne_bytes())?;
        writer.write_all(&self.args_sz.to_ne_bytes())?;
        writer.write_all(&self.flags.bits().to_ne_bytes())?;
        writer.write_all(self.tmode.as_bytes())?;
        writer.write_all(&self.op_mode.as_u32().to_ne_bytes())?;
        Ok(())
    }
}

/// Variable-length part of a launch request.
#[derive(Debug, PartialEq)]
pub struct Payload {
    pub program: CString,
    pub netns: CString,
    pub args: Vec<CString>,
    pub envs: Vec<CString>,
}

impl Payload {
    /// Decodes the payload the header announced. Lengths outside the
    /// protocol caps are treated as a protocol error and poison only the
    /// connection they arrived on.
    pub fn read_from<R: Read>(reader: &mut R, header: &RequestHeader) -> Result<Self> {
        if header.prog_sz < 1 || header.prog_sz > MAX_PATH_SIZE {
            bail!("program path of {} bytes is outside protocol bounds", header.prog_sz);
        }
        if header.netns_sz < 1 || header.netns_sz > MAX_PATH_SIZE {
            bail!("namespace path of {} bytes is outside protocol bounds", header.netns_sz);
        }
        if header.args_sz > MAX_VEC_SIZE {
            bail!("argument vector of {} entries is outside protocol bounds", header.args_sz);
        }
        if header.env_sz > MAX_VEC_SIZE {
            bail!("environment vector of {} entries is outside protocol bounds", header.env_sz);
        }

        let program = read_cstring(reader, header.prog_sz).context("bad program path record")?;
        let netns = read_cstring(reader, header.netns_sz).context("bad namespace path record")?;
        let args = read_records(reader, header.args_sz).context("bad argument vector")?;
        let envs = read_records(reader, header.env_sz).context("bad environment vector")?;

        // A trailing u32 EOF marker may follow; it is historical and never
        // read back.
        Ok(Payload {
            program,
            netns,
            args,
            envs,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.program.as_bytes_with_nul())?;
        writer.write_all(self.netns.as_bytes_with_nul())?;
        write_records(writer, &self.args)?;
        write_records(writer, &self.envs)?;
        Ok(())
    }

    /// The namespace path as seen by the filesystem.
    pub fn netns_path(&self) -> PathBuf {
        PathBuf::from(std::ffi::OsStr::from_bytes(self.netns.to_bytes()))
    }
}

/// Full client request: header plus, for launches, the payload.
#[derive(Debug)]
pub struct Request {
    pub flags: RequestFlags,
    pub op_mode: OpMode,
    pub tmode: TerminalMode,
    pub payload: Option<Payload>,
}

impl Request {
    pub fn header(&self) -> RequestHeader {
        let (prog_sz, netns_sz, env_sz, args_sz) = match &self.payload {
            Some(p) => (
                p.program.as_bytes_with_nul().len(),
                p.netns.as_bytes_with_nul().len(),
                p.envs.len(),
                p.args.len(),
            ),
            None => (0, 0, 0, 0),
        };

        RequestHeader {
            prog_sz,
            netns_sz,
            env_sz,
            args_sz,
            flags: self.flags,
            tmode: self.tmode,
            op_mode: self.op_mode,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header().write_to(writer)?;
        if let Some(payload) = &self.payload {
            payload.write_to(writer)?;
            // Historical EOF marker; receivers must not rely on it.
            writer.write_all(&0u32.to_ne_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One registry entry as it travels in a LIST reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRecord {
    pub uid: u32,
    pub pid: i32,
}

pub fn write_list_reply<W: Write>(writer: &mut W, records: &[WorkerRecord]) -> Result<()> {
    let count = records.len() as u32;
    writer.write_all(&count.to_ne_bytes())?;
    for record in records {
        writer.write_all(&record.uid.to_ne_bytes())?;
        writer.write_all(&record.pid.to_ne_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_list_reply<R: Read>(reader: &mut R) -> Result<Vec<WorkerRecord>> {
    let count = read_u32(reader).context("short read in worker count")? as usize;
    let mut records = Vec::with_capacity(count.min(MAX_VEC_SIZE));
    for _ in 0..count {
        let uid = read_u32(reader).context("short read in worker record")?;
        let mut buf = [0u8; mem::size_of::<i32>()];
        reader
            .read_exact(&mut buf)
            .context("short read in worker record")?;
        records.push(WorkerRecord {
            uid,
            pid: i32::from_ne_bytes(buf),
        });
    }
    Ok(records)
}

pub fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {:?} contains a NUL byte", path))
}

fn read_word<R: Read>(reader: &mut R) -> Result<usize> {
    let mut buf = [0u8; mem::size_of::<usize>()];
    reader
        .read_exact(&mut buf)
        .context("short read in request header")?;
    Ok(usize::from_ne_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; mem::size_of::<u32>()];
    reader.read_exact(&mut buf).context("short read")?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_cstring<R: Read>(reader: &mut R, size: usize) -> Result<CString> {
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).context("short string record")?;
    if buf.pop() != Some(0) {
        bail!("string record is not NUL terminated");
    }
    CString::new(buf).context("string record has an interior NUL")
}

fn read_records<R: Read>(reader: &mut R, count: usize) -> Result<Vec<CString>> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let size = read_word(reader)?;
        if size < 1 || size > MAX_RECORD_SIZE {
            bail!("record of {} bytes is outside protocol bounds", size);
        }
        records.push(read_cstring(reader, size)?);
    }
    Ok(records)
}

fn write_records<W: Write>(writer: &mut W, records: &[CString]) -> Result<()> {
    for record in records {
        let bytes = record.as_bytes_with_nul();
        writer.write_all(&bytes.len().to_ne_bytes())?;
        writer.write_all(bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn sample_payload() -> Payload {
        Payload {
            program: CString::new("/bin/echo").unwrap(),
            netns: CString::new("/var/run/netns/blue").unwrap(),
            args: vec![CString::new("hi").unwrap(), CString::new("there").unwrap()],
            envs: vec![CString::new("LANG=C").unwrap()],
        }
    }

    #[test]
    fn test_header_roundtrip_is_bit_exact() {
        let request = Request {
            flags: RequestFlags::NEW_PTY,
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(sample_payload()),
        };
        let header = request.header();

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let decoded = RequestHeader::read_from(&mut Cursor::new(buf)).unwrap();

        assert_eq!(header, decoded);
        assert_eq!(decoded.prog_sz, "/bin/echo".len() + 1);
        assert_eq!(decoded.netns_sz, "/var/run/netns/blue".len() + 1);
        assert_eq!(decoded.args_sz, 2);
        assert_eq!(decoded.env_sz, 1);
    }

    #[test]
    fn test_launch_request_roundtrip() {
        let request = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(sample_payload()),
        };

        let mut buf = Vec::new();
        request.write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let header = RequestHeader::read_from(&mut cursor).unwrap();
        let payload = Payload::read_from(&mut cursor, &header).unwrap();

        assert_eq!(payload, sample_payload());
    }

    #[test]
    fn test_empty_vectors_roundtrip() {
        let request = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(Payload {
                program: CString::new("/bin/true").unwrap(),
                netns: CString::new("/var/run/netns/red").unwrap(),
                args: vec![],
                envs: vec![],
            }),
        };

        let mut buf = Vec::new();
        request.write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let header = RequestHeader::read_from(&mut cursor).unwrap();
        assert_eq!(header.args_sz, 0);
        assert_eq!(header.env_sz, 0);

        let payload = Payload::read_from(&mut cursor, &header).unwrap();
        assert!(payload.args.is_empty());
        assert!(payload.envs.is_empty());
    }

    #[test]
    fn test_stop_request_has_no_payload() {
        let request = Request {
            flags: RequestFlags::STOP,
            op_mode: OpMode::Unknown,
            tmode: TerminalMode::zeroed(),
            payload: None,
        };

        let mut buf = Vec::new();
        request.write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let header = RequestHeader::read_from(&mut cursor).unwrap();
        assert!(header.flags.contains(RequestFlags::STOP));
        assert_eq!(header.prog_sz, 0);
        // Nothing after the header.
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn test_oversized_path_is_rejected() {
        let mut header = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(sample_payload()),
        }
        .header();
        header.prog_sz = MAX_PATH_SIZE + 1;

        let err = Payload::read_from(&mut Cursor::new(vec![0u8; 64]), &header);
        assert!(err.is_err());
    }

    #[test]
    fn test_oversized_vector_is_rejected() {
        let mut header = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(sample_payload()),
        }
        .header();
        header.args_sz = MAX_VEC_SIZE + 1;

        let mut buf = Vec::new();
        sample_payload().write_to(&mut buf).unwrap();
        assert!(Payload::read_from(&mut Cursor::new(buf), &header).is_err());
    }

    #[test]
    fn test_missing_nul_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"/bin/true"); // no terminating NUL

        let header = RequestHeader {
            prog_sz: 9,
            netns_sz: 1,
            env_sz: 0,
            args_sz: 0,
            flags: RequestFlags::empty(),
            tmode: TerminalMode::zeroed(),
            op_mode: OpMode::Netns,
        };
        assert!(Payload::read_from(&mut Cursor::new(buf), &header).is_err());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let request = Request {
            flags: RequestFlags::empty(),
            op_mode: OpMode::Netns,
            tmode: TerminalMode::zeroed(),
            payload: Some(sample_payload()),
        };
        let header = request.header();

        let mut buf = Vec::new();
        request.payload.as_ref().unwrap().write_to(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        assert!(Payload::read_from(&mut Cursor::new(buf), &header).is_err());
    }

    #[test]
    fn test_list_reply_roundtrip() {
        let records = vec![
            WorkerRecord { uid: 1000, pid: 4242 },
            WorkerRecord { uid: 1000, pid: 4243 },
        ];

        let mut buf = Vec::new();
        write_list_reply(&mut buf, &records).unwrap();
        let decoded = read_list_reply(&mut Cursor::new(buf)).unwrap();

        assert_eq!(records, decoded);
    }

    #[test]
    fn test_empty_list_reply() {
        let mut buf = Vec::new();
        write_list_reply(&mut buf, &[]).unwrap();
        let decoded = read_list_reply(&mut Cursor::new(buf)).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_unknown_flag_bits_are_dropped() {
        let mut buf = Vec::new();
        let header = RequestHeader {
            prog_sz: 0,
            netns_sz: 0,
            env_sz: 0,
            args_sz: 0,
            flags: RequestFlags::LIST,
            tmode: TerminalMode::zeroed(),
            op_mode: OpMode::Unknown,
        };
        header.write_to(&mut buf).unwrap();
        // Force unknown high bits into the flag word.
        let flag_offset = 4 * mem::size_of::<usize>();
        buf[flag_offset + 3] |= 0x80;

        let decoded = RequestHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.flags, RequestFlags::LIST);
    }
}
