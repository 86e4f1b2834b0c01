//! Frame sinks: video file, snapshot display, and the resource wrappers
//! that decide when a sink is opened and guarantee it is flushed.

use fuseview_core::rasterize;
use fuseview_env::{EnvError, FrameSink, RenderFrame};
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Frames per second written into video headers.
pub const VIDEO_FPS: u32 = 30;

/// Uncompressed YUV4MPEG2 (4:4:4) video writer.
///
/// Geometry is taken from the first frame; later frames must match it.
pub struct Y4mVideoSink<W: Write> {
    writer: W,
    geometry: Option<(u32, u32)>,
    frames_written: u64,
}

impl Y4mVideoSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, EnvError> {
        let file = File::create(path.as_ref()).map_err(EnvError::sink)?;
        info!("Writing video to {}", path.as_ref().display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> Y4mVideoSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            geometry: None,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_frame(&mut self, frame: &RenderFrame) -> std::io::Result<()> {
        let n = frame.width() as usize * frame.height() as usize;
        let mut planes = vec![0u8; 3 * n];
        for (i, p) in frame.image().pixels().enumerate() {
            let (y, u, v) = rgb_to_ycbcr(p[0], p[1], p[2]);
            planes[i] = y;
            planes[n + i] = u;
            planes[2 * n + i] = v;
        }
        self.writer.write_all(b"FRAME\n")?;
        self.writer.write_all(&planes)
    }
}

/// BT.601 studio-swing conversion.
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

impl<W: Write> FrameSink for Y4mVideoSink<W> {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        let size = (frame.width(), frame.height());
        match self.geometry {
            None => {
                writeln!(
                    self.writer,
                    "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444",
                    size.0, size.1, VIDEO_FPS
                )
                .map_err(EnvError::sink)?;
                self.geometry = Some(size);
            }
            Some(expected) if expected != size => {
                return Err(EnvError::Sink(format!(
                    "frame is {}x{}, video is {}x{}",
                    size.0, size.1, expected.0, expected.1
                )));
            }
            Some(_) => {}
        }

        let mut drawn = frame.clone();
        rasterize(&mut drawn);
        self.write_frame(&drawn).map_err(EnvError::sink)?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EnvError> {
        debug!(frames = self.frames_written, "flushing video");
        self.writer.flush().map_err(EnvError::sink)
    }
}

/// Rewrites one PPM file with the latest composite.
///
/// Point an auto-reloading image viewer at the path to watch the replay.
pub struct PpmSnapshotDisplay {
    path: PathBuf,
}

impl PpmSnapshotDisplay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Encodes the frame (overlays drawn) as binary PPM.
pub fn encode_ppm(frame: &RenderFrame) -> Result<Vec<u8>, EnvError> {
    let mut drawn = frame.clone();
    rasterize(&mut drawn);
    let mut out = Vec::new();
    let encoder =
        PnmEncoder::new(&mut out).with_subtype(PnmSubtype::Pixmap(SampleEncoding::Binary));
    drawn
        .image()
        .write_with_encoder(encoder)
        .map_err(EnvError::sink)?;
    Ok(out)
}

impl FrameSink for PpmSnapshotDisplay {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        // Write then rename so a viewer never sees a half-written file
        let tmp = self.path.with_extension("ppm.tmp");
        fs::write(&tmp, encode_ppm(frame)?).map_err(EnvError::sink)?;
        fs::rename(&tmp, &self.path).map_err(EnvError::sink)
    }
}

/// Discards every frame.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn push(&mut self, _frame: &RenderFrame) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Opens its sink on the first frame.
///
/// A session that ends before producing a frame never creates the output.
pub struct LazySink<S, F> {
    factory: Option<F>,
    sink: Option<S>,
}

impl<S, F> LazySink<S, F>
where
    S: FrameSink,
    F: FnOnce() -> Result<S, EnvError>,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory: Some(factory),
            sink: None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.sink.is_some()
    }
}

impl<S, F> FrameSink for LazySink<S, F>
where
    S: FrameSink,
    F: FnOnce() -> Result<S, EnvError>,
{
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        if self.sink.is_none() {
            let factory = self
                .factory
                .take()
                .ok_or_else(|| EnvError::sink("sink factory already failed"))?;
            self.sink = Some(factory()?);
        }
        match self.sink.as_mut() {
            Some(sink) => sink.push(frame),
            None => Err(EnvError::sink("sink not acquired")),
        }
    }

    fn finish(&mut self) -> Result<(), EnvError> {
        match self.sink.as_mut() {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }
}

/// Owns a sink and flushes it exactly once, on `finish` or on drop.
pub struct SinkGuard<S: FrameSink> {
    sink: S,
    finished: bool,
}

impl<S: FrameSink> SinkGuard<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            finished: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    /// Flushes now and reports the outcome.
    pub fn finish(mut self) -> Result<(), EnvError> {
        self.finished = true;
        self.sink.finish()
    }
}

impl<S: FrameSink> FrameSink for SinkGuard<S> {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        self.sink.push(frame)
    }
}

impl<S: FrameSink> Drop for SinkGuard<S> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Err(e) = self.sink.finish() {
                error!("Failed to flush sink on unwind: {}", e);
            }
        }
    }
}
