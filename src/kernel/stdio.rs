//! Standard stream handling around the switch into restricted mode.
//!
//! The program's output goes through C stdio buffers, so flushing means
//! `fflush`, not Rust's `std::io`. Everything here is allocation-free except
//! what C stdio does internally.

use crate::config::types::Result;
use std::ffi::c_int;
use std::io::Write;

/// Sentinel printed on stdout and stderr right before restricted mode.
pub const SENTINEL: &str = "<<entering SECCOMP mode>>";

extern "C" {
    static mut stdin: *mut libc::FILE;
    static mut stdout: *mut libc::FILE;
    static mut stderr: *mut libc::FILE;
    fn fgetc(stream: *mut libc::FILE) -> c_int;
    fn ungetc(c: c_int, stream: *mut libc::FILE) -> c_int;
    fn clearerr(stream: *mut libc::FILE);
}

/// Console side effects of the lifecycle.
pub trait Console {
    /// Flush every C output stream.
    fn flush_stdio(&self);
    /// Write `line` to stdout then stderr through C stdio, flushing each.
    fn announce(&self, line: &str);
    /// Peek one byte of stdin without consuming it.
    fn prime_stdin(&self) -> Result<()>;
    /// One diagnostic line for a rejected free.
    fn report_invalid_free(&self, addr: usize);
}

pub fn flush_all() {
    // SAFETY: fflush(NULL) flushes all open output streams.
    unsafe { libc::fflush(std::ptr::null_mut()) };
}

/// write(2) the whole buffer, retrying on EINTR and short writes.
pub fn write_fd(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live buffer of the given length.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if nix::errno::Errno::last() == nix::errno::Errno::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Write `text` plus a newline on a C stream and flush it.
///
/// Going through stdio rather than write(2) makes the C library size and
/// allocate the stream buffer now. Doing that later needs `fstat`, which
/// restricted mode kills.
///
/// # Safety
/// `stream` must be a live, writable C stream.
pub unsafe fn write_stream_line(stream: *mut libc::FILE, text: &str) {
    // SAFETY: both buffers outlive the calls; the caller guarantees `stream`.
    unsafe {
        libc::fwrite(text.as_ptr().cast(), 1, text.len(), stream);
        libc::fwrite(b"\n".as_ptr().cast(), 1, 1, stream);
        libc::fflush(stream);
    }
}

/// Flush, then print `line` on stdout and on stderr.
pub fn announce(line: &str) {
    flush_all();
    // SAFETY: the C library initialises its standard streams before any
    // program code runs and never closes them on our behalf.
    unsafe {
        write_stream_line(stdout, line);
        write_stream_line(stderr, line);
    }
}

/// Briefly switch stdin to non-blocking mode and peek one byte through C
/// stdio so its buffer is set up before restricted mode. The byte is pushed
/// back; when nothing is available the stream's EOF/error state is cleared.
pub fn prime_stdin() -> Result<()> {
    // SAFETY: fcntl on fd 0 with integer arguments only.
    let flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    // SAFETY: `stdin` is the C library's stream object, initialised before
    // any program code runs.
    unsafe {
        let stream = stdin;
        let c = fgetc(stream);
        if c == libc::EOF {
            clearerr(stream);
        } else {
            ungetc(c, stream);
        }
    }

    if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Format the invalid-free diagnostic into `buf`, returning the used prefix.
pub fn format_invalid_free(buf: &mut [u8], addr: usize) -> &[u8] {
    let capacity = buf.len();
    let len = {
        let mut out = &mut buf[..];
        let _ = writeln!(out, "Invalid free at {:#x}", addr);
        capacity - out.len()
    };
    &buf[..len]
}

pub fn report_invalid_free(addr: usize) {
    let mut buf = [0u8; 64];
    let line = format_invalid_free(&mut buf, addr);
    write_fd(libc::STDERR_FILENO, line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_free_line_format() {
        let mut buf = [0u8; 64];
        let line = format_invalid_free(&mut buf, 0xdead_beef);
        assert_eq!(line, b"Invalid free at 0xdeadbeef\n");
    }

    #[test]
    fn invalid_free_line_fits_stack_buffer() {
        let mut buf = [0u8; 64];
        let line = format_invalid_free(&mut buf, usize::MAX);
        assert!(line.ends_with(b"\n"));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn stream_line_is_flushed_through_stdio() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let stream = unsafe { libc::fdopen(fds[1], c"w".as_ptr()) };
        assert!(!stream.is_null());

        unsafe { write_stream_line(stream, SENTINEL) };

        // Nothing is closed yet, so the bytes can only be in the pipe if the
        // stream was flushed.
        let mut buf = [0u8; 64];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(&buf[..n as usize], b"<<entering SECCOMP mode>>\n");

        unsafe {
            libc::fclose(stream);
            libc::close(fds[0]);
        }
    }

    #[test]
    fn sentinel_is_single_line() {
        assert!(!SENTINEL.contains('\n'));
    }
}
