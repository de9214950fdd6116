//! Camera capture through an `ffmpeg` child process.
//!
//! The child encodes H.264 Annex-B to stdout, which is read back with the
//! same reader used for `.h264` files.

use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use callwire_common::{Error, Result};
use tracing::{debug, info};

pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// An ffmpeg input: demuxer name, input string and demuxer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub format: &'static str,
    pub input: String,
    pub options: Vec<(&'static str, String)>,
}

impl DeviceSpec {
    /// The default camera for the platform this binary was built for.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self {
                format: "avfoundation",
                input: "default:none".to_string(),
                options: vec![
                    ("framerate", "30".to_string()),
                    ("video_size", "640x480".to_string()),
                ],
            }
        }

        #[cfg(target_os = "windows")]
        {
            Self {
                format: "vfwcap",
                input: "0".to_string(),
                options: vec![("framerate", "30".to_string())],
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            Self {
                format: "v4l2",
                input: "/dev/video0".to_string(),
                options: vec![],
            }
        }
    }

    /// Fail early for device nodes that do not exist.
    pub fn check_present(&self) -> Result<()> {
        if self.input.starts_with("/dev/") && !Path::new(&self.input).exists() {
            return Err(Error::media_unavailable(format!(
                "capture device {} not found",
                self.input
            )));
        }
        Ok(())
    }

    /// Full ffmpeg argument list for a realtime H.264 capture.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", self.format]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (name, value) in &self.options {
            args.push(format!("-{name}"));
            args.push(value.clone());
        }
        args.extend(
            [
                "-i",
                self.input.as_str(),
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-profile:v",
                "baseline",
                "-pix_fmt",
                "yuv420p",
                "-g",
                "30",
                "-f",
                "h264",
                "-",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }
}

/// Verify the ffmpeg executable can be launched at all.
pub fn probe_ffmpeg(ffmpeg: &str) -> Result<()> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| Error::media_unavailable(format!("cannot launch {ffmpeg}: {e}")))?;
    if !output.status.success() {
        return Err(Error::media_unavailable(format!(
            "{ffmpeg} -version exited with {}",
            output.status
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout);
    debug!("{}", version.lines().next().unwrap_or_default());
    Ok(())
}

/// Start capturing; returns the child and its encoded output.
pub fn spawn_capture(ffmpeg: &str, spec: &DeviceSpec) -> Result<(Child, ChildStdout)> {
    let mut child = Command::new(ffmpeg)
        .args(spec.ffmpeg_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::media_unavailable(format!("cannot launch {ffmpeg}: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::media_unavailable("capture process has no stdout"))?;
    info!(
        "capturing {} {} through {} (pid {})",
        spec.format,
        spec.input,
        ffmpeg,
        child.id()
    );
    Ok((child, stdout))
}
