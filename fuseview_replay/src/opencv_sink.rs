//! OpenCV window, key source and X264 writer.
//!
//! Overlays and captions are drawn natively with `imgproc` instead of the
//! software rasterizer.

use crate::sinks::VIDEO_FPS;
use fuseview_env::{Command, CommandSource, EnvError, FrameSink, Primitive, RenderFrame, Rgb};
use opencv::{
    core::{self, Mat},
    highgui, imgproc,
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait, VideoWriterTraitConst},
};
use std::path::PathBuf;
use tracing::{debug, info};

pub const WINDOW_NAME: &str = "fuseview";

/// Largest circle radius handed to OpenCV (pixels).
const MAX_RADIUS: f64 = 1.0e7;

fn scalar(color: Rgb) -> core::Scalar {
    core::Scalar::new(color.2 as f64, color.1 as f64, color.0 as f64, 0.0)
}

fn point(x: f64, y: f64) -> core::Point {
    core::Point::new(x.round() as i32, y.round() as i32)
}

/// Draws one primitive into `target`, whose origin sits at frame pixel `origin`.
fn draw_primitive(
    target: &mut Mat,
    primitive: &Primitive,
    origin: (f64, f64),
) -> opencv::Result<()> {
    let at = |x: f64, y: f64| point(x - origin.0, y - origin.1);
    match primitive {
        Primitive::Circle { center, radius, color, weight } => imgproc::circle(
            target,
            at(center.x, center.y),
            radius.min(MAX_RADIUS).round() as i32,
            scalar(*color),
            *weight as i32,
            imgproc::LINE_AA,
            0,
        ),
        Primitive::Polyline { points, color, weight } => {
            for pair in points.windows(2) {
                imgproc::line(
                    target,
                    at(pair[0].x, pair[0].y),
                    at(pair[1].x, pair[1].y),
                    scalar(*color),
                    *weight as i32,
                    imgproc::LINE_AA,
                    0,
                )?;
            }
            Ok(())
        }
    }
}

/// Converts a frame to a BGR `Mat` with overlays drawn.
///
/// Each clipped overlay is drawn into a region of interest covering its
/// panel, so OpenCV confines it there.
pub fn to_mat(frame: &RenderFrame) -> opencv::Result<Mat> {
    let mat = Mat::from_slice(frame.as_rgb_bytes())?;
    let mat = mat.reshape(3, frame.height() as i32)?;

    let mut output = Mat::default();
    imgproc::cvt_color(&mat, &mut output, imgproc::COLOR_RGB2BGR, 0)?;

    let bounds = frame.bounds();
    for overlay in &frame.overlays {
        let clip = match &overlay.clip {
            Some(clip) => clip.intersect(&bounds),
            None => Some(bounds),
        };
        let Some(clip) = clip else {
            continue;
        };
        let rect = core::Rect::new(
            clip.x as i32,
            clip.y as i32,
            clip.width as i32,
            clip.height as i32,
        );
        let mut roi = Mat::roi_mut(&mut output, rect)?;
        draw_primitive(&mut *roi, &overlay.primitive, (clip.x as f64, clip.y as f64))?;
    }

    for label in &frame.labels {
        imgproc::put_text(
            &mut output,
            &label.text,
            point(label.origin.x, label.origin.y),
            imgproc::FONT_HERSHEY_PLAIN,
            0.9,
            scalar(label.color),
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }

    Ok(output)
}

/// `highgui` window showing the latest composite.
pub struct HighGuiDisplay {
    /// Run the GUI event loop after each frame (no key reader does it)
    pump_events: bool,
}

impl HighGuiDisplay {
    pub fn new(pump_events: bool) -> Result<Self, EnvError> {
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE).map_err(EnvError::sink)?;
        Ok(Self { pump_events })
    }
}

impl FrameSink for HighGuiDisplay {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        let mat = to_mat(frame).map_err(EnvError::sink)?;
        highgui::imshow(WINDOW_NAME, &mat).map_err(EnvError::sink)?;
        if self.pump_events {
            highgui::wait_key(1).map_err(EnvError::sink)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EnvError> {
        highgui::destroy_window(WINDOW_NAME).map_err(EnvError::sink)
    }
}

/// Keystrokes delivered to the `highgui` window.
#[derive(Debug, Default)]
pub struct HighGuiKeys;

impl CommandSource for HighGuiKeys {
    fn next_command(&mut self) -> Result<Command, EnvError> {
        let key = highgui::wait_key(0).map_err(EnvError::input)?;
        if key < 0 {
            // Window gone
            return Ok(Command::Quit);
        }
        let command = char::from_u32((key & 0xff) as u32)
            .map(Command::from_key)
            .unwrap_or(Command::Advance);
        debug!(key, ?command, "key");
        Ok(command)
    }
}

/// X264 video file, opened with the size of the first frame.
pub struct OpenCvVideoWriter {
    path: PathBuf,
    writer: Option<VideoWriter>,
}

impl OpenCvVideoWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn open(&self, width: i32, height: i32) -> Result<VideoWriter, EnvError> {
        let fourcc = VideoWriter::fourcc('X', '2', '6', '4').map_err(EnvError::sink)?;
        let writer = VideoWriter::new(
            &self.path.to_string_lossy(),
            fourcc,
            VIDEO_FPS as f64,
            core::Size::new(width, height),
            true,
        )
        .map_err(EnvError::sink)?;
        if !writer.is_opened().map_err(EnvError::sink)? {
            return Err(EnvError::Sink(format!("cannot open {}", self.path.display())));
        }
        info!("Writing video to {}", self.path.display());
        Ok(writer)
    }
}

impl FrameSink for OpenCvVideoWriter {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        let mat = to_mat(frame).map_err(EnvError::sink)?;
        if self.writer.is_none() {
            self.writer = Some(self.open(frame.width() as i32, frame.height() as i32)?);
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write(&mat).map_err(EnvError::sink),
            None => Err(EnvError::sink("video writer not open")),
        }
    }

    fn finish(&mut self) -> Result<(), EnvError> {
        match self.writer.as_mut() {
            Some(writer) => writer.release().map_err(EnvError::sink),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuseview_env::{Overlay, PixelRect};
    use nalgebra::Point2;

    #[test]
    fn test_clipped_overlay_stays_in_its_panel() {
        let mut frame = RenderFrame::new(20, 10);
        frame.overlays.push(Overlay::clipped(
            Primitive::Polyline {
                points: vec![Point2::new(0.0, 5.0), Point2::new(19.0, 5.0)],
                color: Rgb(0, 0, 255),
                weight: 1,
            },
            PixelRect::new(10, 0, 10, 10),
        ));
        let mat = to_mat(&frame).unwrap();

        // BGR: blue is channel 0
        assert_eq!(mat.at_2d::<core::Vec3b>(5, 4).unwrap()[0], 0);
        assert!(mat.at_2d::<core::Vec3b>(5, 15).unwrap()[0] > 0);
    }
}
