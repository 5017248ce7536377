use super::y4m::{self, Y4mSource};
use super::{MediaBackend, MediaError, OpenOptions, OpenedMedia, SourceLocator};
use log::{debug, info};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

/// Routes a locator to the backend able to read it
///
/// - files: YUV4MPEG2 natively, any other container through FFmpeg
/// - `tcp://host:port`: same, over a plain socket
/// - `rtsp`, `rtmp`, `http`, `udp`, `rtp`, `srt` and their secure variants:
///   libavformat, with the `network` feature
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBackend;

impl MediaBackend for DefaultBackend {
    fn open(&self, locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
        if let Some(path) = locator.path() {
            return open_file(path, options);
        }

        match locator.scheme() {
            Some("tcp") => open_tcp(locator, options),
            Some(_) if locator.is_live() => open_url(locator, options),
            Some(scheme) => Err(MediaError::Unsupported(format!("{} sources", scheme))),
            None => Err(MediaError::InvalidData(format!("cannot open {}", locator))),
        }
    }
}

#[cfg(feature = "network")]
fn open_url(locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
    debug!("Opening {} through libavformat", locator);
    super::network::open_url(locator, options)
}

#[cfg(not(feature = "network"))]
fn open_url(locator: &SourceLocator, _options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
    Err(MediaError::Unsupported(format!(
        "{} sources (build with the network feature)",
        locator.scheme().unwrap_or_default()
    )))
}

fn open_file(path: &Path, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
    let mut file = File::open(path)?;
    let mut signature = [0u8; y4m::SIGNATURE.len()];
    let read = read_prefix(&mut file, &mut signature)?;
    file.seek(SeekFrom::Start(0))?;

    if &signature[..read] == y4m::SIGNATURE {
        debug!("Opening {} as YUV4MPEG2", path.display());
        let source = Y4mSource::open(file, options)?;
        let decoder = source.decoder();
        return Ok(OpenedMedia {
            source: Box::new(source),
            decoder: Box::new(decoder),
        });
    }

    open_container_file(file, path)
}

#[cfg(feature = "ffmpeg")]
fn open_container_file(file: File, path: &Path) -> Result<OpenedMedia, MediaError> {
    debug!("Opening {} through FFmpeg", path.display());
    super::ffmpeg::open_seekable(file)
}

#[cfg(not(feature = "ffmpeg"))]
fn open_container_file(_file: File, path: &Path) -> Result<OpenedMedia, MediaError> {
    Err(MediaError::Unsupported(format!(
        "container of {} (build with the ffmpeg feature)",
        path.display()
    )))
}

fn open_tcp(locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
    let authority = locator
        .authority()
        .ok_or_else(|| MediaError::InvalidData(format!("{} has no host:port", locator)))?;

    let mut last_error = None;
    let mut connected = None;
    for addr in authority.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, options.open_timeout) {
            Ok(stream) => {
                connected = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let stream = match (connected, last_error) {
        (Some(stream), _) => stream,
        (None, Some(e)) => return Err(MediaError::from_read(e, options.open_timeout)),
        (None, None) => {
            return Err(MediaError::InvalidData(format!("{} resolves to nothing", authority)));
        }
    };

    stream.set_read_timeout(Some(options.read_timeout))?;
    stream.set_nodelay(true)?;
    info!("Connected to {}", locator);

    if peek_signature(&stream, options.open_timeout)? {
        let source = Y4mSource::open(stream, options)?;
        let decoder = source.decoder();
        return Ok(OpenedMedia {
            source: Box::new(source),
            decoder: Box::new(decoder),
        });
    }

    open_container_stream(stream, locator)
}

#[cfg(feature = "ffmpeg")]
fn open_container_stream(stream: TcpStream, locator: &SourceLocator) -> Result<OpenedMedia, MediaError> {
    debug!("Demuxing {} through FFmpeg", locator);
    super::ffmpeg::open_stream(stream)
}

#[cfg(not(feature = "ffmpeg"))]
fn open_container_stream(_stream: TcpStream, locator: &SourceLocator) -> Result<OpenedMedia, MediaError> {
    Err(MediaError::Unsupported(format!(
        "stream format of {} (build with the ffmpeg feature)",
        locator
    )))
}

/// Fill `buf` as far as the reader allows, returns the bytes read
fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, MediaError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(MediaError::Io(e)),
        }
    }
    Ok(filled)
}

/// Wait until the peer sent enough bytes to tell whether it speaks YUV4MPEG2
fn peek_signature(stream: &TcpStream, timeout: Duration) -> Result<bool, MediaError> {
    let deadline = Instant::now() + timeout;
    let mut signature = [0u8; y4m::SIGNATURE.len()];

    loop {
        let available = stream
            .peek(&mut signature)
            .map_err(|e| MediaError::from_read(e, timeout))?;

        if available == 0 {
            return Err(MediaError::InvalidData("connection closed before any data".into()));
        }
        if available == signature.len() || !y4m::SIGNATURE.starts_with(&signature[..available]) {
            return Ok(&signature[..available] == y4m::SIGNATURE);
        }
        if Instant::now() >= deadline {
            return Err(MediaError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
