//! Chunked binary file transfer to the device.
//!
//! The device firmware's handshake is fixed: announce the file with a
//! `download_file` command (size, chunk size, CRC32 over the whole file),
//! wait for `binary_transfer_ready`, stream the bytes, then wait for
//! `binary_transfer_complete` or `binary_transfer_aborted`.
//!
//! Bytes are streamed in fixed-size chunks; within each chunk, writes are
//! broken into smaller paced pieces. The device's UART receive buffer and
//! flash-write pipeline cannot sustain an unthrottled burst; without pacing,
//! bytes are silently dropped and the device-side CRC check fails.

use {
    crate::{
        error::{Error, Result},
        protocol::{
            crc::crc32,
            wire::{self, Command, CompletionKind, CrcStatus},
        },
        session::DeviceChannel,
    },
    log::{debug, info, warn},
    std::{thread, time::Duration},
};

/// How long the device gets to acknowledge a `download_file` command.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the device gets to answer `list_files`.
pub const FILE_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Audio prompts every production unit must carry.
pub const REQUIRED_AUDIO_FILES: [&str; 6] = [
    "tightenStrap.wav",
    "bleedingContinues.wav",
    "pullStrapTighter.wav",
    "inflating.wav",
    "timeRemaining.wav",
    "reattachStrap.wav",
];

/// Pacing profile: the (chunk size, piece size, inter-piece delay) triple
/// trading throughput against device buffer overrun risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedProfile {
    /// Safe default, validated across all hardware revisions.
    #[default]
    Normal,
    /// Roughly double throughput; fine on recent PCBs.
    Fast,
    /// Aggressive; occasional overruns on older flash parts.
    Ultra,
    /// No pacing at all. Bench use only.
    Ludicrous,
}

impl SpeedProfile {
    /// Logical transfer unit size announced in `download_file`.
    #[must_use]
    pub fn chunk_size(self) -> usize {
        match self {
            Self::Normal => 1024,
            Self::Fast => 2048,
            Self::Ultra => 4096,
            Self::Ludicrous => 8192,
        }
    }

    /// Single paced write size.
    #[must_use]
    pub fn piece_size(self) -> usize {
        match self {
            Self::Normal => 128,
            Self::Fast => 256,
            Self::Ultra => 512,
            Self::Ludicrous => 1024,
        }
    }

    /// Delay between pieces.
    #[must_use]
    pub fn piece_delay(self) -> Duration {
        match self {
            Self::Normal => Duration::from_millis(5),
            Self::Fast => Duration::from_millis(2),
            Self::Ultra => Duration::from_millis(1),
            Self::Ludicrous => Duration::ZERO,
        }
    }

    /// Profile name as used on the CLI and in config files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fast => "fast",
            Self::Ultra => "ultra",
            Self::Ludicrous => "ludicrous",
        }
    }
}

impl std::str::FromStr for SpeedProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "fast" => Ok(Self::Fast),
            "ultra" => Ok(Self::Ultra),
            "ludicrous" => Ok(Self::Ludicrous),
            other => Err(Error::Config(format!("unknown speed profile '{other}'"))),
        }
    }
}

impl std::fmt::Display for SpeedProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Window to wait for completion after the last byte: proportional to file
/// size (the device still has to finish writing flash and compute its CRC),
/// clamped, plus a fixed margin.
fn completion_window(size: usize) -> Duration {
    let proportional = Duration::from_millis((size as u64 / 1024) * 100);
    proportional.clamp(Duration::from_secs(2), Duration::from_secs(8)) + Duration::from_secs(5)
}

fn abort_since(channel: &dyn DeviceChannel, since: u64) -> Option<String> {
    channel.replies_since(since).iter().find_map(|r| {
        r.json()
            .and_then(wire::transfer_completion)
            .and_then(|c| match c {
                CompletionKind::Aborted(reason) => Some(reason),
                CompletionKind::Complete(_) => None,
            })
    })
}

/// Push one file to the device.
///
/// `progress` is invoked with `(bytes_sent, total)` before the first byte
/// and after every chunk; `bytes_sent` is non-decreasing and reaches
/// `total` exactly when the stream finished without an abort.
///
/// All failures are terminal for this attempt. Retry policy belongs to the
/// caller.
pub fn push_file(
    channel: &mut dyn DeviceChannel,
    filename: &str,
    data: &[u8],
    profile: SpeedProfile,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let total = data.len();
    let checksum = crc32(data);
    let chunk_size = profile.chunk_size();

    debug!(
        "{}: sending '{filename}' ({total} bytes, chunk {chunk_size}, crc32 {checksum:#010x})",
        channel.port_name()
    );

    let since = channel.mark();
    channel.send(&Command::DownloadFile {
        filename: filename.to_string(),
        size: total as u32,
        chunk_size: chunk_size as u32,
        crc32: checksum,
    })?;

    let signal = channel.wait_json(since, READY_TIMEOUT, &|v| {
        wire::is_transfer_ready(v)
            || matches!(
                wire::transfer_completion(v),
                Some(CompletionKind::Aborted(_))
            )
    });
    match signal {
        None => return Err(Error::ReadyTimeout(filename.to_string())),
        Some(v) => {
            if let Some(CompletionKind::Aborted(reason)) = wire::transfer_completion(&v) {
                return Err(Error::Aborted {
                    filename: filename.to_string(),
                    reason,
                });
            }
        },
    }

    let piece_size = profile.piece_size();
    let piece_delay = profile.piece_delay();
    let mut sent = 0usize;
    progress(sent, total);

    for chunk in data.chunks(chunk_size) {
        for piece in chunk.chunks(piece_size) {
            channel.write_raw(piece)?;
            if !piece_delay.is_zero() {
                thread::sleep(piece_delay);
            }
        }
        sent += chunk.len();
        progress(sent, total);

        // Devices abort mid-stream on storage errors; no point finishing
        // the file if that already happened.
        if let Some(reason) = abort_since(channel, since) {
            return Err(Error::Aborted {
                filename: filename.to_string(),
                reason,
            });
        }
    }

    let window = completion_window(total);
    debug!(
        "{}: '{filename}' streamed, waiting up to {window:?} for completion",
        channel.port_name()
    );
    let completion = channel
        .wait_json(since, window, &|v| wire::transfer_completion(v).is_some())
        .and_then(|v| wire::transfer_completion(&v));

    match completion {
        Some(CompletionKind::Complete(CrcStatus::Passed)) => {
            info!("{}: '{filename}' transferred, crc verified", channel.port_name());
            Ok(())
        },
        Some(CompletionKind::Complete(CrcStatus::Unreported)) => {
            // Older firmware never reports a crc_check field; the completion
            // message itself is the success signal there.
            info!(
                "{}: '{filename}' transferred (no crc status reported)",
                channel.port_name()
            );
            Ok(())
        },
        Some(CompletionKind::Complete(CrcStatus::Failed)) => {
            warn!("{}: '{filename}' crc check failed", channel.port_name());
            Err(Error::ChecksumMismatch(filename.to_string()))
        },
        Some(CompletionKind::Aborted(reason)) => Err(Error::Aborted {
            filename: filename.to_string(),
            reason,
        }),
        None => Err(Error::CompletionTimeout(filename.to_string())),
    }
}

/// Ask the device for its stored file manifest.
pub fn list_device_files(channel: &mut dyn DeviceChannel) -> Result<Vec<String>> {
    let since = channel.mark();
    channel.send(&Command::ListFiles)?;
    let reply = channel
        .wait_json(since, FILE_LIST_TIMEOUT, &|v| {
            wire::parse_file_list(v).is_some()
        })
        .ok_or_else(|| Error::Timeout("no file list reply".to_string()))?;
    Ok(wire::parse_file_list(&reply).unwrap_or_default())
}

/// Required filenames not present on the device. Pure set difference; safe
/// to re-run.
#[must_use]
pub fn missing_files(required: &[String], present: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !present.iter().any(|p| p == *name))
        .cloned()
        .collect()
}

/// Re-enumerate the device manifest and assert every required file is now
/// present. Independent confirmation beyond per-file completion signals.
pub fn verify_required_files(channel: &mut dyn DeviceChannel, required: &[String]) -> Result<()> {
    let present = list_device_files(channel)?;
    let missing = missing_files(required, &present);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::VerificationFailed(format!(
            "device manifest is missing: {}",
            missing.join(", ")
        )))
    }
}

/// Elapsed-time helper for callers reporting throughput.
#[must_use]
pub fn throughput_bps(bytes: usize, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    bytes as f64 / elapsed.as_secs_f64()
}

/// One named payload ready to push to a device.
#[derive(Debug, Clone)]
pub struct AudioFile {
    /// Filename as it will exist on the device.
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

/// The set of audio files a production run pushes, loaded once and shared
/// across workers.
#[derive(Debug, Clone, Default)]
pub struct AudioLibrary {
    files: Vec<AudioFile>,
}

impl AudioLibrary {
    /// Load `required` filenames from `dir`. Every name must exist; a
    /// production run with an incomplete library is refused up front.
    pub fn load(dir: &std::path::Path, required: &[&str]) -> Result<Self> {
        let mut files = Vec::with_capacity(required.len());
        for name in required {
            let path = dir.join(name);
            let data = std::fs::read(&path).map_err(|e| {
                Error::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            files.push(AudioFile {
                name: (*name).to_string(),
                data,
            });
        }
        Ok(Self { files })
    }

    /// Build a library from in-memory payloads.
    #[must_use]
    pub fn from_memory(files: Vec<AudioFile>) -> Self {
        Self { files }
    }

    /// Filenames in the library.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    /// Payload for one filename.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data.as_slice())
    }

    /// Iterate over all files.
    pub fn iter(&self) -> impl Iterator<Item = &AudioFile> {
        self.files.iter()
    }

    /// Number of files in the library.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the library is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedChannel;
    use crate::transport::ReplyPayload;
    use serde_json::json;

    fn ready() -> ReplyPayload {
        ReplyPayload::Json(json!({"command": "download_file", "response": "binary_transfer_ready"}))
    }

    fn complete(crc: Option<&str>) -> ReplyPayload {
        let mut v = json!({"response": "binary_transfer_complete"});
        if let Some(status) = crc {
            v["crc_check"] = json!(status);
        }
        ReplyPayload::Json(v)
    }

    fn ready_then_complete(crc: Option<&'static str>) -> ScriptedChannel {
        ScriptedChannel::new("/dev/ttyACM0", move |cmd| match cmd {
            Command::DownloadFile { .. } => vec![ready(), complete(crc)],
            _ => vec![],
        })
    }

    #[test]
    fn five_kb_file_streams_three_chunk_bursts() {
        let data = vec![0xA5u8; 5000];
        let expected_crc = crc32(&data);
        let mut channel = ready_then_complete(Some("passed"));

        let mut reported = Vec::new();
        push_file(
            &mut channel,
            "audio.wav",
            &data,
            SpeedProfile::Fast,
            &mut |sent, total| reported.push((sent, total)),
        )
        .expect("transfer");

        // One announcement, carrying the CRC computed up front.
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Command::DownloadFile {
                filename,
                size,
                chunk_size,
                crc32: announced,
            } => {
                assert_eq!(filename, "audio.wav");
                assert_eq!(*size, 5000);
                assert_eq!(*chunk_size, 2048);
                assert_eq!(*announced, expected_crc);
            },
            other => panic!("unexpected command: {other:?}"),
        }

        // Chunk bursts 2048 + 2048 + 904, written as 256-byte pieces.
        assert_eq!(channel.raw_writes().iter().sum::<usize>(), 5000);
        assert_eq!(reported, vec![(0, 5000), (2048, 5000), (4096, 5000), (5000, 5000)]);
    }

    #[test]
    fn progress_is_monotonic_and_reaches_total() {
        let data = vec![7u8; 3000];
        let mut channel = ready_then_complete(Some("passed"));
        let mut last = 0usize;
        let mut final_sent = 0usize;
        push_file(
            &mut channel,
            "inflating.wav",
            &data,
            SpeedProfile::Normal,
            &mut |sent, total| {
                assert!(sent >= last);
                assert!(sent <= total);
                last = sent;
                final_sent = sent;
            },
        )
        .expect("transfer");
        assert_eq!(final_sent, 3000);
    }

    #[test]
    fn missing_ready_ack_is_a_ready_timeout() {
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", |_| vec![]);
        let result = push_file(
            &mut channel,
            "audio.wav",
            &[0u8; 128],
            SpeedProfile::Normal,
            &mut |_, _| {},
        );
        assert!(matches!(result, Err(Error::ReadyTimeout(f)) if f == "audio.wav"));
        // Nothing streamed without the ack.
        assert!(channel.raw_writes().is_empty());
    }

    #[test]
    fn abort_before_streaming_carries_reason() {
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", |cmd| match cmd {
            Command::DownloadFile { .. } => vec![ReplyPayload::Json(
                json!({"response": "binary_transfer_aborted", "reason": "fs full"}),
            )],
            _ => vec![],
        });
        let result = push_file(
            &mut channel,
            "audio.wav",
            &[0u8; 128],
            SpeedProfile::Normal,
            &mut |_, _| {},
        );
        assert!(matches!(result, Err(Error::Aborted { reason, .. }) if reason == "fs full"));
    }

    #[test]
    fn mid_stream_abort_stops_the_transfer() {
        let mut written = 0usize;
        let channel = ScriptedChannel::new("/dev/ttyACM0", |cmd| match cmd {
            Command::DownloadFile { .. } => vec![ready()],
            _ => vec![],
        })
        .with_raw_hook(move |piece| {
            written += piece.len();
            if written >= 2048 {
                vec![ReplyPayload::Json(
                    json!({"response": "binary_transfer_aborted", "reason": "write error"}),
                )]
            } else {
                vec![]
            }
        });
        let mut channel = channel;

        let data = vec![0u8; 8192];
        let result = push_file(
            &mut channel,
            "audio.wav",
            &data,
            SpeedProfile::Fast,
            &mut |_, _| {},
        );
        assert!(matches!(result, Err(Error::Aborted { reason, .. }) if reason == "write error"));
        // The remaining chunks were never written.
        assert!(channel.raw_writes().iter().sum::<usize>() < 8192);
    }

    #[test]
    fn explicit_crc_failure_is_a_checksum_mismatch() {
        let mut channel = ready_then_complete(Some("failed"));
        let result = push_file(
            &mut channel,
            "audio.wav",
            &[1u8; 256],
            SpeedProfile::Ludicrous,
            &mut |_, _| {},
        );
        assert!(matches!(result, Err(Error::ChecksumMismatch(_))));
    }

    /// Deployed firmware frequently omits `crc_check` on completion; the
    /// completion message alone is accepted as success. Documented
    /// leniency, pinned here on purpose.
    #[test]
    fn completion_without_crc_field_is_accepted() {
        let mut channel = ready_then_complete(None);
        let result = push_file(
            &mut channel,
            "audio.wav",
            &[1u8; 256],
            SpeedProfile::Ludicrous,
            &mut |_, _| {},
        );
        assert!(result.is_ok());
    }

    #[test]
    fn silent_device_after_stream_is_a_completion_timeout() {
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", |cmd| match cmd {
            Command::DownloadFile { .. } => vec![ready()],
            _ => vec![],
        });
        let result = push_file(
            &mut channel,
            "audio.wav",
            &[1u8; 256],
            SpeedProfile::Ludicrous,
            &mut |_, _| {},
        );
        assert!(matches!(result, Err(Error::CompletionTimeout(_))));
    }

    #[test]
    fn stale_completion_from_previous_file_cannot_satisfy_the_next() {
        // First transfer completes; its completion reply stays buffered.
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", {
            let mut calls = 0;
            move |cmd| match cmd {
                Command::DownloadFile { .. } => {
                    calls += 1;
                    if calls == 1 {
                        vec![ready(), complete(Some("passed"))]
                    } else {
                        // Second file: device acks ready but never completes.
                        vec![ready()]
                    }
                },
                _ => vec![],
            }
        });

        push_file(
            &mut channel,
            "first.wav",
            &[1u8; 64],
            SpeedProfile::Ludicrous,
            &mut |_, _| {},
        )
        .expect("first transfer");

        let result = push_file(
            &mut channel,
            "second.wav",
            &[2u8; 64],
            SpeedProfile::Ludicrous,
            &mut |_, _| {},
        );
        assert!(
            matches!(result, Err(Error::CompletionTimeout(f)) if f == "second.wav"),
            "stale completion must not leak into the second transfer"
        );
    }

    #[test]
    fn file_enumeration_is_idempotent() {
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", |cmd| match cmd {
            Command::ListFiles => vec![ReplyPayload::Json(json!({
                "response": "file_list",
                "files": ["inflating.wav", "tightenStrap.wav"]
            }))],
            _ => vec![],
        });

        let required: Vec<String> = REQUIRED_AUDIO_FILES.iter().map(|s| s.to_string()).collect();
        let first = missing_files(&required, &list_device_files(&mut channel).unwrap());
        let second = missing_files(&required, &list_device_files(&mut channel).unwrap());
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(!first.contains(&"inflating.wav".to_string()));
    }

    #[test]
    fn verify_required_files_reports_missing_names() {
        let mut channel = ScriptedChannel::new("/dev/ttyACM0", |cmd| match cmd {
            Command::ListFiles => vec![ReplyPayload::Json(json!({
                "response": "file_list",
                "files": ["inflating.wav"]
            }))],
            _ => vec![],
        });
        let required = vec!["inflating.wav".to_string(), "timeRemaining.wav".to_string()];
        let result = verify_required_files(&mut channel, &required);
        match result {
            Err(Error::VerificationFailed(msg)) => assert!(msg.contains("timeRemaining.wav")),
            other => panic!("expected verification failure, got {other:?}"),
        }
    }

    #[test]
    fn completion_window_is_clamped() {
        assert_eq!(completion_window(0), Duration::from_secs(7));
        assert_eq!(completion_window(1024 * 1024), Duration::from_secs(13));
        // 40 KiB -> 4 s proportional + 5 s margin
        assert_eq!(completion_window(40 * 1024), Duration::from_secs(9));
    }

    #[test]
    fn audio_library_requires_every_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("inflating.wav"), b"riff").unwrap();

        let ok = AudioLibrary::load(dir.path(), &["inflating.wav"]).expect("load");
        assert_eq!(ok.names(), vec!["inflating.wav"]);
        assert_eq!(ok.get("inflating.wav"), Some(b"riff".as_slice()));

        let err = AudioLibrary::load(dir.path(), &["inflating.wav", "timeRemaining.wav"]);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn speed_profile_parsing() {
        assert_eq!("fast".parse::<SpeedProfile>().unwrap(), SpeedProfile::Fast);
        assert_eq!(
            "LUDICROUS".parse::<SpeedProfile>().unwrap(),
            SpeedProfile::Ludicrous
        );
        assert!("warp".parse::<SpeedProfile>().is_err());
    }
}
