//! Encoder invocation for a stream job.
//!
//! The argument list is fully determined by the job: the same job always
//! produces the same command line.

use tracing::debug;

use crate::models::StreamJob;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn for_job(program: &str, job: &StreamJob) -> Self {
        let args = Self::build_args(job);
        debug!(
            "Built encoder command for stream {} with {} arguments",
            job.stream_key,
            args.len()
        );
        Self {
            program: program.to_string(),
            args,
        }
    }

    /// Build encoder arguments for a job
    pub fn build_args(job: &StreamJob) -> Vec<String> {
        let mut args = Vec::new();
        let loop_enabled = job.encoding.loop_enabled;

        // Input 0: video
        Self::add_input_args(
            &mut args,
            &job.source_video.to_string_lossy(),
            loop_enabled,
            Some("mp4"),
        );

        // Input 1: external audio, only when enabled and present on disk
        let external_audio = Self::external_audio(job);
        if let Some(audio) = &external_audio {
            Self::add_input_args(&mut args, audio, loop_enabled, None);
        }

        Self::add_video_args(&mut args, job);
        Self::add_audio_args(&mut args);
        args.extend(["-f".to_string(), "flv".to_string()]);
        Self::add_stream_mapping(&mut args, external_audio.is_some());

        args.push(job.output_url());
        args
    }

    fn external_audio(job: &StreamJob) -> Option<String> {
        if !job.encoding.audio_enabled {
            return None;
        }
        job.source_audio
            .as_ref()
            .filter(|path| path.exists())
            .map(|path| path.to_string_lossy().into_owned())
    }

    fn add_input_args(
        args: &mut Vec<String>,
        input: &str,
        loop_enabled: bool,
        format: Option<&str>,
    ) {
        args.push("-re".to_string());
        if loop_enabled {
            args.extend(["-stream_loop".to_string(), "-1".to_string()]);
        }
        if let Some(format) = format {
            args.extend(["-f".to_string(), format.to_string()]);
        }
        args.extend(["-i".to_string(), input.to_string()]);
    }

    fn add_video_args(args: &mut Vec<String>, job: &StreamJob) {
        let bitrate = job.encoding.bitrate_kbps;
        args.extend([
            "-r".to_string(),
            job.encoding.fps.to_string(),
            "-threads".to_string(),
            "2".to_string(),
            "-x264-params".to_string(),
            "nal-hrd=cbr".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-b:v".to_string(),
            format!("{bitrate}k"),
            "-maxrate".to_string(),
            format!("{bitrate}k"),
            "-bufsize".to_string(),
            format!("{}k", u64::from(bitrate) * 2),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            "60".to_string(),
            "-vf".to_string(),
            format!("scale={}", job.encoding.resolution),
        ]);
    }

    fn add_audio_args(args: &mut Vec<String>) {
        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
            "-ar".to_string(),
            "44100".to_string(),
        ]);
    }

    fn add_stream_mapping(args: &mut Vec<String>, external_audio: bool) {
        args.extend(["-map".to_string(), "0:v:0".to_string()]);
        if external_audio {
            args.extend(["-map".to_string(), "1:a:0".to_string()]);
        } else {
            // Keep the video's own audio track when it has one
            args.extend(["-map".to_string(), "0:a?".to_string()]);
        }
    }

    /// Human readable command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
