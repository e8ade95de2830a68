//! "Read as much as is immediately available from a non-blocking fd"
//! utility (spec §6, "Read-available utility").
//!
//! The four legal mode combinations from the distilled spec
//! (discard | into-buffer | into-ring) × (raw | c-string) are modelled as
//! one enum per destination rather than an OR'd bitfield, so an invalid
//! combination (e.g. "discard, but also rewrite embedded NULs") cannot be
//! constructed at all.

use std::io;
use std::os::fd::RawFd;

use crate::error::Result;
use crate::ring::RingBuffer;

const CHUNK: usize = 4096;

/// Whether embedded NUL bytes get rewritten to `0x01` (tmux's control-mode
/// stream is line oriented text, never containing true NULs from a
/// well-behaved server; this protects the C-string-style framing that the
/// parser's "need more data" detection in [`crate::protocol`] leans on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Raw,
    CString,
}

pub enum Destination<'a> {
    Discard,
    Buffer(&'a mut Vec<u8>, Format),
    Ring(&'a mut RingBuffer, Format),
}

/// Drains everything currently available on `fd` (which MUST already be in
/// non-blocking mode) into `dest`. Returns the number of bytes actually
/// read from the kernel (before any NUL rewriting).
pub fn read_available(fd: RawFd, dest: Destination<'_>) -> Result<usize> {
    let mut chunk = [0u8; CHUNK];
    let mut total = 0usize;
    let mut staged = Vec::new();

    loop {
        // SAFETY: `chunk` is a valid, appropriately sized buffer for the
        // duration of this call and `fd` is owned by the caller.
        let n = unsafe {
            libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
        };
        if n > 0 {
            total += n as usize;
            staged.extend_from_slice(&chunk[..n as usize]);
            continue;
        }
        if n == 0 {
            break; // EOF
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => break,
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }

    match dest {
        Destination::Discard => {}
        Destination::Buffer(buf, format) => {
            if format == Format::CString {
                rewrite_nuls(&mut staged);
                buf.extend_from_slice(&staged);
                buf.push(0);
            } else {
                buf.extend_from_slice(&staged);
            }
        }
        Destination::Ring(ring, format) => {
            if format == Format::CString {
                rewrite_nuls(&mut staged);
            }
            ring.push(&staged)?;
            if format == Format::CString {
                ring.push(&[0])?;
            }
        }
    }

    Ok(total)
}

fn rewrite_nuls(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        if *b == 0 {
            *b = 1;
        }
    }
}

/// Sets `O_NONBLOCK` on `fd`. Used by the supervisor (§4.2) and control
/// client (§4.3) right after a pipe's parent-side descriptor is obtained.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reads_into_ring_and_appends_trailing_nul() {
        let (mut w, r) = UnixStream::pair().unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        w.write_all(b"hello\0world").unwrap();
        drop(w);

        let mut ring = RingBuffer::new();
        let n = read_available(r.as_raw_fd(), Destination::Ring(&mut ring, Format::CString))
            .unwrap();
        assert_eq!(n, 11);
        let (a, b) = ring.peek();
        let mut combined = a.to_vec();
        combined.extend_from_slice(b);
        assert_eq!(combined, b"hello\x01world\0");
    }

    #[test]
    fn reads_into_buffer_raw() {
        let (mut w, r) = UnixStream::pair().unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        w.write_all(b"abc").unwrap();
        drop(w);

        let mut buf = Vec::new();
        let n = read_available(r.as_raw_fd(), Destination::Buffer(&mut buf, Format::Raw)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, b"abc");
    }
}
