//! Fixed-size binary telemetry records.
//!
//! A log is a flat sequence of records with no header or footer. Each record
//! is a packed little-endian header followed by one camera frame:
//!
//! ```text
//! offset  size  field
//!      0  3x4   frame id, time seconds, time microseconds   (u32)
//!     12  2x1   throttle, steering                          (i8)
//!     14  6x4   accel xyz, gyro xyz                         (f32)
//!     38  1     servo position                              (u8)
//!     39  4x2   wheel encoder ticks                         (u16, wrapping)
//!     47  4x2   auxiliary wheel words                       (u16, opaque)
//!     55  WxH   camera image                                (u8)
//! ```

use fuseview_env::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Size of the packed record header in bytes.
pub const HEADER_SIZE: usize = 55;

/// Raw actuator command magnitude corresponding to full scale.
pub const ACTUATOR_FULL_SCALE: f64 = 127.0;

/// Errors raised while reading or writing telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Fewer bytes than one record remain (expected at the end of a log)
    #[error("End of telemetry stream ({trailing} trailing bytes)")]
    EndOfStream { trailing: usize },

    /// Rewind requested past the first record
    #[error("Cannot seek back {requested} records from record {position}")]
    SeekBeforeStart { requested: u64, position: u64 },

    /// Record image does not match the stream layout
    #[error("Image is {width}x{height}, layout expects {expected_width}x{expected_height}")]
    ImageSize {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }
}

/// Camera geometry of a log; fixes the record size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    /// Image width in pixels
    pub image_width: u32,

    /// Image height in pixels
    pub image_height: u32,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            image_width: 320,
            image_height: 140,
        }
    }
}

impl RecordLayout {
    /// Total bytes per record.
    pub fn record_size(&self) -> usize {
        HEADER_SIZE + self.pixel_count()
    }

    /// Camera bytes per record.
    pub fn pixel_count(&self) -> usize {
        self.image_width as usize * self.image_height as usize
    }
}

/// One decoded telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub frame_id: u32,
    pub time_sec: u32,
    pub time_usec: u32,

    /// Raw throttle command, [-127, 127]
    pub throttle: i8,

    /// Raw steering command, [-127, 127]
    pub steering: i8,

    /// Acceleration in m/s^2
    pub accel: [f32; 3],

    /// Angular rate in rad/s
    pub gyro: [f32; 3],

    pub servo: u8,
    pub wheel_ticks: [u16; 4],

    /// Recorder-specific per-wheel words, carried through untouched
    pub wheel_aux: [u16; 4],

    pub image: GrayImage,
}

impl TelemetryRecord {
    /// Timestamp in seconds.
    pub fn timestamp(&self) -> f64 {
        self.time_sec as f64 + self.time_usec as f64 / 1_000_000.0
    }

    /// Throttle normalized to [-1, 1].
    pub fn throttle_normalized(&self) -> f64 {
        self.throttle as f64 / ACTUATOR_FULL_SCALE
    }

    /// Steering normalized to [-1, 1].
    pub fn steering_normalized(&self) -> f64 {
        self.steering as f64 / ACTUATOR_FULL_SCALE
    }

    /// Vertical-axis angular rate.
    pub fn yaw_rate(&self) -> f64 {
        self.gyro[2] as f64
    }

    /// Summed per-wheel tick advance since `previous`, with u16 wraparound.
    pub fn wheel_tick_delta(&self, previous: &[u16; 4]) -> u32 {
        self.wheel_ticks
            .iter()
            .zip(previous)
            .map(|(now, before)| now.wrapping_sub(*before) as u32)
            .sum()
    }

    /// Decodes one record; `bytes` must be exactly `layout.record_size()` long.
    pub fn decode(bytes: &[u8], layout: RecordLayout) -> Result<Self, TelemetryError> {
        if bytes.len() < layout.record_size() {
            return Err(TelemetryError::EndOfStream { trailing: bytes.len() });
        }

        let mut fields = FieldReader { bytes, offset: 0 };
        let frame_id = u32::from_le_bytes(fields.take());
        let time_sec = u32::from_le_bytes(fields.take());
        let time_usec = u32::from_le_bytes(fields.take());
        let throttle = i8::from_le_bytes(fields.take());
        let steering = i8::from_le_bytes(fields.take());
        let accel = [(); 3].map(|_| f32::from_le_bytes(fields.take()));
        let gyro = [(); 3].map(|_| f32::from_le_bytes(fields.take()));
        let servo = u8::from_le_bytes(fields.take());
        let wheel_ticks = [(); 4].map(|_| u16::from_le_bytes(fields.take()));
        let wheel_aux = [(); 4].map(|_| u16::from_le_bytes(fields.take()));
        debug_assert_eq!(fields.offset, HEADER_SIZE);

        let pixels = bytes[HEADER_SIZE..layout.record_size()].to_vec();
        let image = GrayImage::from_raw(layout.image_width, layout.image_height, pixels).ok_or(
            TelemetryError::ImageSize {
                width: layout.image_width,
                height: layout.image_height,
                expected_width: layout.image_width,
                expected_height: layout.image_height,
            },
        )?;

        Ok(Self {
            frame_id,
            time_sec,
            time_usec,
            throttle,
            steering,
            accel,
            gyro,
            servo,
            wheel_ticks,
            wheel_aux,
            image,
        })
    }

    /// Encodes the record in the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.image.as_raw().len());
        out.extend_from_slice(&self.frame_id.to_le_bytes());
        out.extend_from_slice(&self.time_sec.to_le_bytes());
        out.extend_from_slice(&self.time_usec.to_le_bytes());
        out.extend_from_slice(&self.throttle.to_le_bytes());
        out.extend_from_slice(&self.steering.to_le_bytes());
        for v in self.accel.iter().chain(&self.gyro) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.push(self.servo);
        for v in self.wheel_ticks.iter().chain(&self.wheel_aux) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(self.image.as_raw());
        out
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl FieldReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut field = [0u8; N];
        field.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        field
    }
}

/// Sequential record reader with record-granular rewind.
pub struct TelemetryReader<R> {
    inner: R,
    layout: RecordLayout,
    buffer: Vec<u8>,

    /// Number of whole records consumed so far
    position: u64,
}

impl TelemetryReader<BufReader<File>> {
    /// Opens a log file.
    pub fn open(path: impl AsRef<Path>, layout: RecordLayout) -> Result<Self, TelemetryError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), layout))
    }
}

impl<R: Read + Seek> TelemetryReader<R> {
    /// Wraps a stream positioned at a record boundary.
    pub fn new(inner: R, layout: RecordLayout) -> Self {
        Self {
            inner,
            layout,
            buffer: vec![0u8; layout.record_size()],
            position: 0,
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Index of the next record to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record.
    ///
    /// Returns `EndOfStream` if fewer than `record_size()` bytes remain.
    pub fn read_record(&mut self) -> Result<TelemetryRecord, TelemetryError> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.inner.read(&mut self.buffer[filled..]) {
                Ok(0) => return Err(TelemetryError::EndOfStream { trailing: filled }),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let record = TelemetryRecord::decode(&self.buffer, self.layout)?;
        self.position += 1;
        Ok(record)
    }

    /// Moves the stream back `count` whole records.
    pub fn seek_back(&mut self, count: u64) -> Result<(), TelemetryError> {
        if count > self.position {
            return Err(TelemetryError::SeekBeforeStart {
                requested: count,
                position: self.position,
            });
        }
        self.seek_to(self.position - count)
    }

    /// Positions the stream so the next read returns record `index`.
    pub fn seek_to(&mut self, index: u64) -> Result<(), TelemetryError> {
        // Absolute seek so a partial read at the tail cannot skew the offset
        self.inner
            .seek(SeekFrom::Start(index * self.layout.record_size() as u64))?;
        self.position = index;
        Ok(())
    }
}

/// Appends records to a log.
pub struct TelemetryWriter<W: Write> {
    inner: W,
    layout: RecordLayout,
    records_written: u64,
}

impl TelemetryWriter<BufWriter<File>> {
    /// Creates (truncates) a log file.
    pub fn create(path: impl AsRef<Path>, layout: RecordLayout) -> Result<Self, TelemetryError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), layout))
    }
}

impl<W: Write> TelemetryWriter<W> {
    pub fn new(inner: W, layout: RecordLayout) -> Self {
        Self {
            inner,
            layout,
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Writes one record; its image must match the layout.
    pub fn write_record(&mut self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        if record.image.width() != self.layout.image_width
            || record.image.height() != self.layout.image_height
        {
            return Err(TelemetryError::ImageSize {
                width: record.image.width(),
                height: record.image.height(),
                expected_width: self.layout.image_width,
                expected_height: self.layout.image_height,
            });
        }
        self.inner.write_all(&record.encode())?;
        self.records_written += 1;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W, TelemetryError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
