use nix::errno::Errno;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd};

/// Classification carried across the status pipe. The daemon maps these to
/// its RPC error codes, so the discriminants are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorKind {
    Unknown = 0,
    InvalidValue = 1,
    NoSpace = 2,
    ResourceNotAvailable = 3,
}

impl ErrorKind {
    fn from_wire(kind: i32) -> ErrorKind {
        match kind {
            1 => ErrorKind::InvalidValue,
            2 => ErrorKind::NoSpace,
            3 => ErrorKind::ResourceNotAvailable,
            _ => ErrorKind::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::NoSpace => "NoSpace",
            ErrorKind::ResourceNotAvailable => "ResourceNotAvailable",
        }
    }
}

/// Error value produced anywhere in the launch path. Carries the OS errno
/// (0 when the failure was not a syscall) and a human readable message.
///
/// These are plain values: the init and the intermediate serialize their
/// first fatal error onto the status pipe and exit, the supervisor
/// deserializes it and returns it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub errno: i32,
    pub message: String,
}

pub type TaskResult<T> = Result<T, TaskError>;

impl TaskError {
    pub fn new(kind: ErrorKind, errno: i32, message: impl Into<String>) -> TaskError {
        TaskError {
            kind,
            errno,
            message: message.into(),
        }
    }

    /// Unknown error with the errno of the failed syscall.
    pub fn os(errno: Errno, message: impl Into<String>) -> TaskError {
        TaskError::new(ErrorKind::Unknown, errno as i32, message)
    }

    pub fn invalid(message: impl Into<String>) -> TaskError {
        TaskError::new(ErrorKind::InvalidValue, 0, message)
    }

    /// Serialize onto the status pipe: kind, errno, then a length-prefixed
    /// message, all native-endian. A launch that never writes this record
    /// reads back as success on the other end.
    pub fn serialize<F: AsFd>(&self, fd: &F) -> TaskResult<()> {
        let mut buf = Vec::with_capacity(12 + self.message.len());
        buf.extend_from_slice(&(self.kind as i32).to_ne_bytes());
        buf.extend_from_slice(&self.errno.to_ne_bytes());
        buf.extend_from_slice(&(self.message.len() as u32).to_ne_bytes());
        buf.extend_from_slice(self.message.as_bytes());

        write_all(fd, &buf)
            .map_err(|e| TaskError::os(e, format!("write error record to status pipe")))
    }

    /// Counterpart of `serialize`. Returns `None` when the writer exited
    /// without reporting an error (EOF before the first field).
    pub fn deserialize<F: AsFd>(fd: &F) -> TaskResult<Option<TaskError>> {
        let mut word = [0u8; 4];
        match read_exact(fd, &mut word) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) => {
                return Err(TaskError::os(e, format!("read error kind from status pipe")));
            }
        }
        let kind = ErrorKind::from_wire(i32::from_ne_bytes(word));

        if !read_exact(fd, &mut word)
            .map_err(|e| TaskError::os(e, format!("read errno from status pipe")))?
        {
            return Err(TaskError::invalid("truncated error record: missing errno"));
        }
        let errno = i32::from_ne_bytes(word);

        if !read_exact(fd, &mut word)
            .map_err(|e| TaskError::os(e, format!("read message length from status pipe")))?
        {
            return Err(TaskError::invalid(
                "truncated error record: missing message length",
            ));
        }
        let len = u32::from_ne_bytes(word) as usize;

        let mut message = vec![0u8; len];
        if len > 0
            && !read_exact(fd, &mut message)
                .map_err(|e| TaskError::os(e, format!("read message from status pipe")))?
        {
            return Err(TaskError::invalid(
                "truncated error record: short message",
            ));
        }

        Ok(Some(TaskError {
            kind,
            errno,
            message: String::from_utf8_lossy(&message).into_owned(),
        }))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errno != 0 {
            write!(
                f,
                "{}: {} ({})",
                self.kind.as_str(),
                self.message,
                Errno::from_raw(self.errno).desc()
            )
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

impl std::error::Error for TaskError {}

impl From<Errno> for TaskError {
    fn from(errno: Errno) -> TaskError {
        TaskError::os(errno, errno.desc().to_string())
    }
}

pub(crate) fn write_all<F: AsFd>(fd: &F, mut buf: &[u8]) -> Result<(), Errno> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/* Returns false on EOF before the buffer is full. */
pub(crate) fn read_exact<F: AsFd>(fd: &F, buf: &mut [u8]) -> Result<bool, Errno> {
    let mut off = 0;
    while off < buf.len() {
        match nix::unistd::read(fd.as_fd().as_raw_fd(), &mut buf[off..]) {
            Ok(0) => return Ok(false),
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn test_error_over_pipe() {
        let (r, w) = pipe().expect("pipe");
        let err = TaskError::new(ErrorKind::ResourceNotAvailable, libc::ENOMEM, "clone()");
        err.serialize(&w).expect("serialize");
        drop(w);

        let got = TaskError::deserialize(&r).expect("deserialize");
        assert_eq!(got, Some(err));
    }

    #[test]
    fn test_eof_is_success() {
        let (r, w) = pipe().expect("pipe");
        drop(w);
        assert_eq!(TaskError::deserialize(&r).expect("deserialize"), None);
    }

    #[test]
    fn test_truncated_record() {
        let (r, w) = pipe().expect("pipe");
        nix::unistd::write(&w, &1i32.to_ne_bytes()).expect("write");
        drop(w);
        assert!(TaskError::deserialize(&r).is_err());
    }

    #[test]
    fn test_unknown_wire_kind_maps_to_unknown() {
        assert_eq!(ErrorKind::from_wire(42), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_wire(3), ErrorKind::ResourceNotAvailable);
    }
}
