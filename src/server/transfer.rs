//! Text responses, file streaming and body draining on a [`Connection`].

use crate::{
    errors::TransferError,
    http::{response::ResponseHead, types::StatusCode},
    server::connection::Connection,
};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf, MAIN_SEPARATOR},
    process,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// How a file transfer was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The transfer ran to the end.
    Completed,
    /// The transfer did not happen and the fallback page for this status was sent.
    Fallback(StatusCode),
}

/// Why an upload target was refused before touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum UnsafeUpload {
    #[error("empty directory")]
    EmptyDir,
    #[error("empty file name")]
    EmptyName,
    #[error("directory does not end with a path separator")]
    NoTrailingSeparator,
    #[error("file name is absolute")]
    AbsoluteName,
    #[error("path contains a `..` segment")]
    Traversal,
    #[error("declared size {0} is not positive")]
    NonPositiveSize(i64),
}

pub(crate) fn validate_upload(dir: &str, name: &str, size: i64) -> Result<(), UnsafeUpload> {
    if dir.is_empty() {
        return Err(UnsafeUpload::EmptyDir);
    }
    if name.is_empty() {
        return Err(UnsafeUpload::EmptyName);
    }
    if !dir.ends_with(['/', MAIN_SEPARATOR]) {
        return Err(UnsafeUpload::NoTrailingSeparator);
    }
    if name.starts_with(['/', '\\']) || Path::new(name).is_absolute() {
        return Err(UnsafeUpload::AbsoluteName);
    }
    if has_parent_segment(dir) || has_parent_segment(name) {
        return Err(UnsafeUpload::Traversal);
    }
    if size <= 0 {
        return Err(UnsafeUpload::NonPositiveSize(size));
    }

    Ok(())
}

#[inline]
fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

impl Connection {
    /// Sends `head` followed by `body`.
    ///
    /// The head's content length is replaced by the length of `body`.
    pub fn send_text(&self, head: ResponseHead<'_>, body: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(256 + body.len());
        head.content_length(body.len() as u64).render(&mut buf);
        buf.extend_from_slice(body);

        self.send_all(&buf)
    }

    /// Sends the configured fallback page for `status`.
    ///
    /// Statuses without a configured page are sent with their canonical
    /// reason phrase and an empty body.
    pub fn send_fallback(&self, status: StatusCode, keep_alive: bool) -> io::Result<()> {
        match self.pages.for_status(status) {
            Some(page) => self.send_text(page.head(status, keep_alive), page.html.as_bytes()),
            None => self.send_text(ResponseHead::new(status, 0).keep_alive(keep_alive), b""),
        }
    }

    /// Streams the file at `path` as the body of a `200` response.
    ///
    /// `head` supplies keep-alive, MIME type, charset and download name;
    /// its status is forced to `200` and its length to the file size. A file
    /// that cannot be opened is answered with the `404` page, one whose size
    /// cannot be read with the `500` page. Both count as answered and return
    /// [`Delivery::Fallback`].
    ///
    /// Once the head is out, any failure is returned as an error and the
    /// connection must not be reused.
    pub fn send_file(
        &self,
        path: impl AsRef<Path>,
        head: ResponseHead<'_>,
    ) -> Result<Delivery, TransferError> {
        let path = path.as_ref();
        let keep_alive = head.is_keep_alive();

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(conn = self.id(), path = %path.display(), error = %e, "cannot open file");
                return self.fallback(StatusCode::NotFound, keep_alive);
            }
        };
        let size = match file.metadata() {
            Ok(metadata) if metadata.is_dir() => {
                warn!(conn = self.id(), path = %path.display(), "refusing to send a directory");
                return self.fallback(StatusCode::NotFound, keep_alive);
            }
            Ok(metadata) => metadata.len(),
            Err(e) => {
                error!(conn = self.id(), path = %path.display(), error = %e, "cannot read file size");
                return self.fallback(StatusCode::InternalServerError, keep_alive);
            }
        };

        let mut buf = Vec::with_capacity(256);
        head.with_status(StatusCode::Ok).content_length(size).render(&mut buf);
        self.send_all(&buf)?;

        let mut stream = self.stream()?;
        let mut sent = 0;
        while sent < size {
            let chunk = (size - sent).min(self.transfer.send_chunk);
            let copied = io::copy(&mut (&file).take(chunk), &mut stream)?;
            sent += copied;

            if copied < chunk {
                error!(conn = self.id(), path = %path.display(), sent, size, "file shrank while sending");
                return Err(TransferError::FileTruncated {
                    expected: size,
                    sent,
                });
            }
        }

        debug!(conn = self.id(), path = %path.display(), size, "file sent");
        Ok(Delivery::Completed)
    }

    /// Stores the next `size` bytes of the socket as `dir` + `name`, then
    /// answers with the `200` page.
    ///
    /// `dir` must end with a path separator and neither part may contain a
    /// `..` segment; `name` must be relative and `size` positive. Otherwise,
    /// or when the file cannot be created or written, the declared body is
    /// drained and the `500` page sent, returning [`Delivery::Fallback`].
    ///
    /// The body is written to a private staging file in `dir` and moved
    /// over the target only once complete, so concurrent uploads of the same
    /// name never interleave and an existing file is replaced whole.
    ///
    /// A socket failure or an early close of the peer is returned as an
    /// error and the connection must not be reused.
    pub fn receive_file(
        &self,
        dir: &str,
        name: &str,
        size: i64,
        keep_alive: bool,
    ) -> Result<Delivery, TransferError> {
        if let Err(problem) = validate_upload(dir, name, size) {
            warn!(conn = self.id(), dir, name, %problem, "upload refused");
            return self.refuse_upload(size.max(0) as u64, keep_alive);
        }

        let expected = size as u64;
        let path = Path::new(dir).join(name);
        let staging = Staging::in_dir(dir);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&staging.path) {
            Ok(file) => file,
            Err(e) => {
                error!(conn = self.id(), path = %staging.path.display(), error = %e, "cannot create file");
                return self.refuse_upload(expected, keep_alive);
            }
        };

        let capacity = (self.transfer.receive_chunk.max(1) as u64).min(expected) as usize;
        let mut buf = vec![0u8; capacity];
        let mut received: u64 = 0;

        while received < expected {
            let want = (expected - received).min(buf.len() as u64) as usize;
            let chunk = &mut buf[..want];

            let mut filled = 0;
            while filled < want {
                match self.recv(&mut chunk[filled..])? {
                    0 => {
                        return Err(TransferError::PeerClosed {
                            expected,
                            received: received + filled as u64,
                        })
                    }
                    n => filled += n,
                }
            }
            received += want as u64;

            if let Err(e) = file.write_all(chunk) {
                error!(conn = self.id(), path = %staging.path.display(), error = %e, "file write failed");
                return self.refuse_upload(expected - received, keep_alive);
            }
        }

        drop(file);
        if let Err(e) = staging.commit(&path) {
            error!(conn = self.id(), path = %path.display(), error = %e, "cannot store file");
            return self.fallback(StatusCode::InternalServerError, keep_alive);
        }

        debug!(conn = self.id(), path = %path.display(), size = expected, "file received");
        self.send_fallback(StatusCode::Ok, keep_alive)?;
        Ok(Delivery::Completed)
    }

    /// Reads and discards `length` body bytes, returning up to
    /// `capture_size` of them.
    pub(crate) fn drain(&self, length: u64) -> Result<Vec<u8>, TransferError> {
        let mut captured = Vec::new();
        let mut buf = vec![0u8; self.transfer.drain_chunk.max(1)];
        let mut received: u64 = 0;

        while received < length {
            let want = (length - received).min(buf.len() as u64) as usize;
            let n = match self.recv(&mut buf[..want])? {
                0 => {
                    return Err(TransferError::PeerClosed {
                        expected: length,
                        received,
                    })
                }
                n => n,
            };

            let room = self.transfer.capture_size.saturating_sub(captured.len());
            captured.extend_from_slice(&buf[..n.min(room)]);
            received += n as u64;
        }

        Ok(captured)
    }

    #[inline]
    fn fallback(&self, status: StatusCode, keep_alive: bool) -> Result<Delivery, TransferError> {
        self.send_fallback(status, keep_alive)?;
        Ok(Delivery::Fallback(status))
    }

    /// Skips the `unread` body bytes of a refused upload so the next message
    /// starts where the peer thinks it does, then sends the `500` page.
    fn refuse_upload(&self, unread: u64, keep_alive: bool) -> Result<Delivery, TransferError> {
        self.drain(unread)?;
        self.fallback(StatusCode::InternalServerError, keep_alive)
    }
}

/// An upload in progress. The file is removed on drop unless committed.
struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    fn in_dir(dir: &str) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self {
            path: Path::new(dir).join(format!(".upload-{}-{n}.part", process::id())),
            committed: false,
        }
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn upload_targets() {
        #[rustfmt::skip]
        let cases = [
            ("/srv/up/", "a.bin",         1,  Ok(())),
            ("/srv/up/", "sub/a.bin",     10, Ok(())),
            ("/srv/up/", "a..b",          10, Ok(())),
            ("",         "a.bin",         1,  Err(UnsafeUpload::EmptyDir)),
            ("/srv/up/", "",              1,  Err(UnsafeUpload::EmptyName)),
            ("/srv/up",  "a.bin",         1,  Err(UnsafeUpload::NoTrailingSeparator)),
            ("/srv/up/", "/etc/passwd",   1,  Err(UnsafeUpload::AbsoluteName)),
            ("/srv/up/", "\\evil",        1,  Err(UnsafeUpload::AbsoluteName)),
            ("/srv/up/", "../a.bin",      1,  Err(UnsafeUpload::Traversal)),
            ("/srv/up/", "sub\\..\\a",    1,  Err(UnsafeUpload::Traversal)),
            ("/srv/../", "a.bin",         1,  Err(UnsafeUpload::Traversal)),
            ("/srv/up/", "a.bin",         0,  Err(UnsafeUpload::NonPositiveSize(0))),
            ("/srv/up/", "a.bin",         -5, Err(UnsafeUpload::NonPositiveSize(-5))),
        ];

        for (dir, name, size, expected) in cases {
            assert_eq!(validate_upload(dir, name, size), expected, "{dir:?} {name:?}");
        }
    }
}

#[cfg(test)]
mod transfer_tests {
    use super::*;
    use crate::{
        http::codec::{ByteGenerator, FrameOutcome, HttpCodec, MessageCodec, Decoded},
        limits::{ConnLimits, TransferLimits},
        server::connection::test_pair,
    };
    use std::{fs, net::TcpStream, thread};

    fn read_head(client: &mut TcpStream) -> String {
        let head = match HttpCodec::default().frame(&mut ByteGenerator::new(&*client)) {
            FrameOutcome::Complete(head) => head,
            other => panic!("{other:?}"),
        };
        String::from_utf8(head).unwrap()
    }

    fn small_chunks() -> TransferLimits {
        TransferLimits {
            send_chunk: 7,
            receive_chunk: 5,
            ..TransferLimits::default()
        }
    }

    #[test]
    fn text_and_fallback() {
        let (connection, mut client) = test_pair::pair();

        connection
            .send_text(ResponseHead::new(StatusCode::Created, 999).mime("text/plain"), b"done")
            .unwrap();
        connection.send_fallback(StatusCode::Forbidden, false).unwrap();

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(head.contains("content-length: 4\r\n"));
        let mut body = [0u8; 4];
        client.read_exact(&mut body).unwrap();
        assert_eq!(&body, b"done");

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\nconnection: close\r\n"));
        assert!(head.contains("content-length: 0\r\n"));
    }

    #[test]
    fn missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (connection, mut client) = test_pair::pair();

        let delivery = connection
            .send_file(dir.path().join("absent"), ResponseHead::new(StatusCode::Ok, 0))
            .unwrap();
        assert_eq!(delivery, Delivery::Fallback(StatusCode::NotFound));

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    fn read_page(connection: &Connection, client: &mut TcpStream, status: &str) {
        let head = read_head(client);
        assert!(head.starts_with(status), "{head}");
        let length = connection.pages().internal_error.html.len();
        let mut body = vec![0u8; length];
        client.read_exact(&mut body).unwrap();
    }

    #[test]
    fn rejected_upload_drains_body() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let (connection, mut client) = test_pair::pair();

        // A body that looks like a request must not be read as one
        let smuggled = b"GET /admin HTTP/1.1\r\n\r\n";
        for (name, body) in [("zero.bin", &b""[..]), ("../escape.bin", &smuggled[..])] {
            client.write_all(body).unwrap();
            client.write_all(b"NEXT").unwrap();

            let delivery = connection.receive_file(&root, name, body.len() as i64, true).unwrap();
            assert_eq!(delivery, Delivery::Fallback(StatusCode::InternalServerError));
            read_page(&connection, &mut client, "HTTP/1.1 500 Internal Server Error\r\n");

            let mut rest = [0u8; 4];
            connection.recv_exact(&mut rest).unwrap();
            assert_eq!(&rest, b"NEXT", "{name}");
        }

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!dir.path().parent().unwrap().join("escape.bin").exists());
    }

    #[test]
    fn unwritable_upload_drains_body() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plain"), b"").unwrap();
        let (connection, mut client) = test_pair::with(&ConnLimits::default(), small_chunks());

        // A regular file used as the directory fails before the body is read;
        // a missing subdirectory fails only when the finished body is stored
        let cases = [
            (format!("{}/plain/", dir.path().display()), "a.bin"),
            (format!("{}/", dir.path().display()), "missing/a.bin"),
        ];
        for (root, name) in &cases {
            client.write_all(b"0123456789abcdef").unwrap();
            client.write_all(b"NEXT").unwrap();

            let delivery = connection.receive_file(root, name, 16, true).unwrap();
            assert_eq!(delivery, Delivery::Fallback(StatusCode::InternalServerError));
            read_page(&connection, &mut client, "HTTP/1.1 500 Internal Server Error\r\n");

            let mut rest = [0u8; 4];
            connection.recv_exact(&mut rest).unwrap();
            assert_eq!(&rest, b"NEXT", "{root}{name}");
        }

        let mut left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        left.sort();
        assert_eq!(left, ["plain"]);
    }

    #[test]
    fn concurrent_uploads_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let target = dir.path().join("same.bin");

        let (slow, mut slow_client) = test_pair::with(&ConnLimits::default(), small_chunks());
        let (fast, mut fast_client) = test_pair::with(&ConnLimits::default(), small_chunks());

        slow_client.write_all(b"AAAAA").unwrap();
        let slow_root = root.clone();
        let slow_upload = thread::spawn(move || {
            slow.receive_file(&slow_root, "same.bin", 10, true).unwrap()
        });

        fast_client.write_all(b"BBBBBBBBBB").unwrap();
        assert_eq!(fast.receive_file(&root, "same.bin", 10, true).unwrap(), Delivery::Completed);
        assert_eq!(fs::read(&target).unwrap(), b"BBBBBBBBBB");

        slow_client.write_all(b"aaaaa").unwrap();
        assert_eq!(slow_upload.join().unwrap(), Delivery::Completed);
        assert_eq!(fs::read(&target).unwrap(), b"AAAAAaaaaa");

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(read_head(&mut fast_client).starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(read_head(&mut slow_client).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn peer_closing_mid_upload() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let (connection, mut client) = test_pair::with(&ConnLimits::default(), small_chunks());

        client.write_all(b"123456").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        match connection.receive_file(&root, "part.bin", 20, true) {
            Err(TransferError::PeerClosed { expected, received }) => {
                assert_eq!((expected, received), (20, 6));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn drain_captures_prefix() {
        let transfer = TransferLimits {
            drain_chunk: 3,
            capture_size: 4,
            ..TransferLimits::default()
        };
        let (connection, mut client) = test_pair::with(&ConnLimits::default(), transfer);

        client.write_all(b"abcdefghijNEXT").unwrap();
        assert_eq!(connection.drain(10).unwrap(), b"abcd");

        let mut rest = [0u8; 4];
        connection.recv_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"NEXT");

        client.shutdown(std::net::Shutdown::Write).unwrap();
        match connection.drain(5) {
            Err(TransferError::PeerClosed { expected: 5, received: 0 }) => {}
            other => panic!("{other:?}"),
        }
    }

    /// Sends `size` bytes through `send_file` on one connection and stores
    /// them with `receive_file` on another.
    fn round_trip(size: usize) {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", target_dir.path().display());

        let content: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        let source = source_dir.path().join("source.bin");
        fs::write(&source, &content).unwrap();

        let (sender, sender_peer) = test_pair::with(&ConnLimits::default(), small_chunks());
        let (receiver, mut uploader) = test_pair::with(&ConnLimits::default(), small_chunks());

        let sending = thread::spawn(move || {
            let head = ResponseHead::new(StatusCode::Ok, 0).download("source.bin");
            sender.send_file(&source, head).unwrap()
        });

        // Relay the downloaded body, as a client would, into the upload socket
        let mut downloader = sender_peer;
        let head = read_head(&mut downloader);
        let message = match HttpCodec::default().decode(
            format!("GET / HTTP/1.1\r\n{}", head.split_once("\r\n").unwrap().1).as_bytes(),
        ) {
            Decoded::Message(message) => message,
            other => panic!("{other:?}"),
        };
        assert_eq!(message.content_length(), size as u64);
        assert!(message.header("content-disposition").is_some());

        let mut body = vec![0u8; size];
        downloader.read_exact(&mut body).unwrap();
        uploader.write_all(&body).unwrap();

        assert_eq!(sending.join().unwrap(), Delivery::Completed);
        assert_eq!(
            receiver.receive_file(&root, "copy.bin", size as i64, true).unwrap(),
            Delivery::Completed
        );

        let head = read_head(&mut uploader);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(fs::read(target_dir.path().join("copy.bin")).unwrap(), content);
    }

    #[test]
    fn round_trip_sizes() {
        // One byte, exactly one send chunk and one receive chunk, then
        // several chunks of both plus a remainder
        for size in [1, 5, 7, 35, 7 * 5 * 3 + 2] {
            round_trip(size);
        }
    }
}
