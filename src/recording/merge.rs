//! External stereo merge.
//!
//! The two mono files are joined into one stereo Opus file by an external
//! `ffmpeg` process: inbound on the left channel, outbound on the right.

use std::path::Path;

use crate::config::MERGER_DEADLINE;

/// Channel-join filter: resample both inputs to 48 kHz, downmix each to
/// mono, then join as a stereo pair.
pub const MERGE_FILTER: &str = "[0]aresample=48000,pan=mono|c0=c0[l]; \
[1]aresample=48000,pan=mono|c0=c0[r]; \
[l][r]join=inputs=2:channel_layout=stereo[a]";

/// Argument vector for the merger invocation.
pub fn build_merge_args(left: &Path, right: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_owned(),
        "-i".to_owned(),
        left.to_string_lossy().into_owned(),
        "-i".to_owned(),
        right.to_string_lossy().into_owned(),
        "-filter_complex".to_owned(),
        MERGE_FILTER.to_owned(),
        "-map".to_owned(),
        "[a]".to_owned(),
        "-c:a".to_owned(),
        "libopus".to_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Run the merger with its deadline. Non-zero exit is a dependency failure.
pub async fn merge_stereo(left: &Path, right: &Path, output: &Path) -> anyhow::Result<()> {
    let args = build_merge_args(left, right, output);
    tracing::debug!(output = %output.display(), "starting audio merger");

    let run = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .output();

    let result = tokio::time::timeout(MERGER_DEADLINE, run)
        .await
        .map_err(|_| anyhow::anyhow!("audio merger exceeded {MERGER_DEADLINE:?}"))?
        .map_err(|e| anyhow::anyhow!("failed to launch audio merger: {e}"))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        anyhow::bail!(
            "audio merger exited with {}: {}",
            result.status,
            stderr.chars().take(512).collect::<String>()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn filter_matches_channel_contract() {
        assert!(MERGE_FILTER.contains("[0]aresample=48000,pan=mono|c0=c0[l]"));
        assert!(MERGE_FILTER.contains("[1]aresample=48000,pan=mono|c0=c0[r]"));
        assert!(MERGE_FILTER.contains("join=inputs=2:channel_layout=stereo[a]"));
    }

    #[test]
    fn args_order_inputs_then_filter_then_output() {
        let args = build_merge_args(
            &PathBuf::from("/tmp/l.opus"),
            &PathBuf::from("/tmp/r.opus"),
            &PathBuf::from("/tmp/merged.opus"),
        );
        let left = args.iter().position(|a| a == "/tmp/l.opus").unwrap();
        let right = args.iter().position(|a| a == "/tmp/r.opus").unwrap();
        let filter = args.iter().position(|a| a == MERGE_FILTER).unwrap();
        assert!(left < right && right < filter);
        assert_eq!(args.last().unwrap(), "/tmp/merged.opus");
        assert_eq!(args[0], "-y");
        assert!(args.contains(&"libopus".to_owned()));
    }
}
