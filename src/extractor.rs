//! ExtractorDriver: locates the `yt-dlp` binary, builds argument vectors,
//! spawns child processes, and streams their output as events.
//!
//! Grounded in the teacher's `ytdlp.rs` (`YtDlpRunner::exec_json_lines`'s
//! concurrent stdout/stderr reading and `CREATE_NO_WINDOW` handling) and
//! `download_manager.rs::execute_download` (the progress-regex fallback
//! chain and cancellation via a `broadcast::Receiver`).

use std::path::{Path, PathBuf};
use std::process::Stdio;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use crate::error::{Result, VidBeeError};
use crate::format_resolver::{self, Preset};
use crate::models::{
    DownloadProgress, DownloadRequest, FormatDescriptor, PlaylistEntryRef, PlaylistInfo,
    RequestKind, VideoInfo,
};
use crate::settings::Settings;

const MAX_CAPTURED_LINES: usize = 20_000;

/// Events streamed out of a running `download` invocation.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    FormatHint(String),
    Close(Option<i32>),
    Error(String),
}

pub struct ExtractorDriver {
    binary: PathBuf,
}

impl ExtractorDriver {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if cfg!(windows) {
            cmd.env("PYTHONIOENCODING", "utf-8");
            cmd.env("LC_ALL", "C.UTF-8");
            #[cfg(windows)]
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    fn common_args(settings: &Settings) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--encoding".to_string(),
            "utf-8".to_string(),
        ];
        if let Some(proxy) = &settings.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        // Cookies file takes exclusive precedence over browser cookies.
        if let Some(cookies) = &settings.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        } else if let Some(browser) = &settings.cookies_from_browser {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.clone());
        }
        if let Some(cfg) = &settings.config_location {
            args.push("--config-location".to_string());
            args.push(expand_home(cfg));
        }
        args
    }

    /// `info(url, settings) -> VideoInfo`.
    pub async fn info(&self, url: &str, settings: &Settings) -> Result<VideoInfo> {
        let mut args = vec!["-j".to_string(), "--no-playlist".to_string()];
        args.extend(Self::common_args(settings));
        args.push(url.to_string());

        let (lines, _) = self.exec_capture(&args).await?;
        let first = lines.into_iter().find(|l| looks_like_json_object(l)).ok_or_else(|| {
            VidBeeError::Parse {
                where_: "extractor.info".to_string(),
                message: "no JSON object on stdout".to_string(),
            }
        })?;
        parse_video_info(&first)
    }

    /// `playlist(url, settings) -> PlaylistInfo`.
    pub async fn playlist(&self, url: &str, settings: &Settings) -> Result<PlaylistInfo> {
        let mut args = vec!["-j".to_string(), "--flat-playlist".to_string()];
        args.extend(Self::common_args(settings));
        args.push(url.to_string());

        let (lines, _) = self.exec_capture(&args).await?;
        let json_lines: Vec<&String> = lines.iter().filter(|l| looks_like_json_object(l)).collect();
        if json_lines.is_empty() {
            return Err(VidBeeError::Parse {
                where_: "extractor.playlist".to_string(),
                message: "no JSON objects on stdout".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(json_lines.len());
        let mut id = String::new();
        let mut title = String::new();
        for (idx, line) in json_lines.iter().enumerate() {
            let v: Value = serde_json::from_str(line).map_err(|e| VidBeeError::Parse {
                where_: "extractor.playlist".to_string(),
                message: e.to_string(),
            })?;
            let entry_id = v.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let entry_title = v.get("title").and_then(Value::as_str).map(str::to_string);
            let entry_url = v
                .get("url")
                .and_then(Value::as_str)
                .or_else(|| v.get("webpage_url").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            if idx == 0 {
                id = entry_id.clone();
                title = entry_title.clone().unwrap_or_default();
            }
            entries.push(PlaylistEntryRef {
                id: entry_id,
                title: entry_title,
                url: entry_url,
                index: idx as u32,
            });
        }

        Ok(PlaylistInfo {
            id,
            title,
            entry_count: entries.len(),
            entries,
        })
    }

    /// Builds the argument vector for a `download` invocation per §4.1.
    pub fn build_download_args(
        &self,
        request: &DownloadRequest,
        selected: Option<&FormatDescriptor>,
        output_template: &str,
        settings: &Settings,
    ) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-mtime".to_string(),
            "--encoding".to_string(),
            "utf-8".to_string(),
        ];

        let selector = match request.kind {
            RequestKind::Video => match selected {
                Some(descriptor) => format_resolver::video_selector(descriptor),
                None => "bestvideo+bestaudio/best".to_string(),
            },
            RequestKind::Audio => {
                format_resolver::audio_selector(selected, request.explicit_audio_format.as_deref())
            }
        };
        args.push("-f".to_string());
        args.push(selector);

        if request.start_time.is_some() || request.end_time.is_some() {
            let start = request.start_time.clone().unwrap_or_default();
            let end = request.end_time.clone().unwrap_or_default();
            args.push("--download-sections".to_string());
            args.push(format!("*{start}-{end}"));
        }

        if settings.embed_subs {
            args.push("--embed-subs".to_string());
            args.push("--sub-langs".to_string());
            args.push("all".to_string());
        } else {
            args.push("--no-embed-subs".to_string());
            args.push("--write-subs".to_string());
        }
        args.push(if settings.embed_thumbnail {
            "--embed-thumbnail".to_string()
        } else {
            "--no-embed-thumbnail".to_string()
        });
        args.push(if settings.embed_metadata {
            "--embed-metadata".to_string()
        } else {
            "--no-embed-metadata".to_string()
        });
        args.push(if settings.embed_chapters {
            "--embed-chapters".to_string()
        } else {
            "--no-embed-chapters".to_string()
        });

        args.push("-o".to_string());
        args.push(output_template.to_string());

        if cfg!(windows) {
            args.push("--windows-filenames".to_string());
        }

        args.extend(Self::common_args(settings));
        args.push(request.url.clone());
        args
    }

    /// Spawns `download` and streams parsed events until the process closes.
    /// `cancel_rx` fires once to request early termination.
    pub async fn download(
        &self,
        args: &[String],
        mut cancel_rx: broadcast::Receiver<()>,
        on_event: impl Fn(DownloadEvent) + Send + 'static,
    ) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.args(args);

        let mut child: Child = cmd
            .spawn()
            .map_err(|e| VidBeeError::Extractor {
                stderr: e.to_string(),
                exit_code: None,
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut stdout_captured = 0usize;
        let mut stderr_captured = 0usize;
        let mut stdout_closed = false;
        let mut stderr_closed = false;

        loop {
            if stdout_closed && stderr_closed {
                break;
            }
            tokio::select! {
                _ = cancel_rx.recv() => {
                    let _ = child.kill().await;
                    on_event(DownloadEvent::Close(None));
                    return Ok(());
                }
                line = stdout_reader.next_line(), if !stdout_closed => {
                    match line {
                        Ok(Some(l)) => {
                            if stdout_captured < MAX_CAPTURED_LINES {
                                stdout_captured += 1;
                                handle_stdout_line(&l, &on_event);
                            }
                        }
                        Ok(None) => stdout_closed = true,
                        Err(e) => {
                            on_event(DownloadEvent::Error(e.to_string()));
                            stdout_closed = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_closed => {
                    match line {
                        Ok(Some(_l)) => {
                            stderr_captured += 1;
                            let _ = stderr_captured;
                        }
                        Ok(None) => stderr_closed = true,
                        Err(_) => stderr_closed = true,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| VidBeeError::Extractor {
                stderr: e.to_string(),
                exit_code: None,
            })?;
        on_event(DownloadEvent::Close(status.code()));
        Ok(())
    }

    async fn exec_capture(&self, args: &[String]) -> Result<(Vec<String>, Option<i32>)> {
        let mut cmd = self.base_command();
        cmd.args(args);

        let mut child = cmd.spawn().map_err(|e| VidBeeError::Extractor {
            stderr: e.to_string(),
            exit_code: None,
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut stdout_closed = false;
        let mut stderr_closed = false;

        while !(stdout_closed && stderr_closed) {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_closed => {
                    match line {
                        Ok(Some(l)) => {
                            if stdout_lines.len() < MAX_CAPTURED_LINES {
                                stdout_lines.push(l);
                            }
                        }
                        Ok(None) => stdout_closed = true,
                        Err(_) => stdout_closed = true,
                    }
                }
                line = stderr_reader.next_line(), if !stderr_closed => {
                    match line {
                        Ok(Some(l)) => {
                            if stderr_lines.len() < MAX_CAPTURED_LINES {
                                stderr_lines.push(l);
                            }
                        }
                        Ok(None) => stderr_closed = true,
                        Err(_) => stderr_closed = true,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| VidBeeError::Extractor {
            stderr: e.to_string(),
            exit_code: None,
        })?;

        if !status.success() {
            return Err(VidBeeError::Extractor {
                stderr: stderr_lines.join("\n"),
                exit_code: status.code(),
            });
        }

        Ok((stdout_lines, status.code()))
    }
}

fn expand_home(path: &Path) -> String {
    let s = path.display().to_string();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    }
    s
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn parse_video_info(json_line: &str) -> Result<VideoInfo> {
    let v: Value = serde_json::from_str(json_line).map_err(|e| VidBeeError::Parse {
        where_: "extractor.info".to_string(),
        message: e.to_string(),
    })?;

    let id = v.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let title = v.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
    let thumbnail = v.get("thumbnail").and_then(Value::as_str).map(str::to_string);
    let duration = v.get("duration").and_then(Value::as_f64);
    let description = v.get("description").and_then(Value::as_str).map(str::to_string);
    let uploader = v.get("uploader").and_then(Value::as_str).map(str::to_string);
    let view_count = v.get("view_count").and_then(Value::as_u64);
    let webpage_url = v.get("webpage_url").and_then(Value::as_str).map(str::to_string);

    let formats = v
        .get("formats")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(parse_format_descriptor).collect())
        .unwrap_or_default();

    Ok(VideoInfo {
        id,
        title,
        thumbnail,
        duration,
        description,
        uploader,
        view_count,
        webpage_url,
        formats,
    })
}

fn parse_format_descriptor(v: &Value) -> Option<FormatDescriptor> {
    let id = v.get("format_id").and_then(Value::as_str)?.to_string();
    Some(FormatDescriptor {
        id,
        ext: v.get("ext").and_then(Value::as_str).unwrap_or_default().to_string(),
        width: v.get("width").and_then(Value::as_u64).map(|n| n as u32),
        height: v.get("height").and_then(Value::as_u64).map(|n| n as u32),
        fps: v.get("fps").and_then(Value::as_f64),
        vcodec: v.get("vcodec").and_then(Value::as_str).map(str::to_string),
        acodec: v.get("acodec").and_then(Value::as_str).map(str::to_string),
        tbr: v.get("tbr").and_then(Value::as_f64),
        filesize: v.get("filesize").and_then(Value::as_u64),
        filesize_approx: v.get("filesize_approx").and_then(Value::as_u64),
        format_note: v.get("format_note").and_then(Value::as_str).map(str::to_string),
        protocol: v.get("protocol").and_then(Value::as_str).map(str::to_string),
        video_ext: v.get("video_ext").and_then(Value::as_str).map(str::to_string),
        audio_ext: v.get("audio_ext").and_then(Value::as_str).map(str::to_string),
        language: v.get("language").and_then(Value::as_str).map(str::to_string),
    })
}

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[vidbee\]\s+(?P<percent>[\d.]+)%\s+of\s+~?(?P<total>[\d.]+\w+)\s+at\s+(?P<speed>[\d.]+\w+/s|\w+)\s+ETA\s+(?P<eta>[\d:]+|\w+)")
        .expect("valid regex")
});
static FALLBACK_PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(?P<percent>[\d.]+)%\s+of\s+~?(?P<total>[\d.]+\w+)").expect("valid regex")
});
static PERCENT_ONLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<percent>[\d.]+)%").expect("valid regex"));
static FORMAT_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""formatId"\s*:\s*"(?P<id>[^"]+)"|format\s+(?P<id2>\S+)"#).expect("valid regex"));

fn handle_stdout_line(line: &str, on_event: &impl Fn(DownloadEvent)) {
    if let Some(caps) = PROGRESS_RE.captures(line).or_else(|| FALLBACK_PROGRESS_RE.captures(line)) {
        let percent = caps.name("percent").and_then(|m| m.as_str().parse::<f64>().ok());
        let total = caps
            .name("total")
            .and_then(|m| format_resolver::parse_byte_size(m.as_str()));
        let speed = caps
            .name("speed")
            .and_then(|m| format_resolver::parse_byte_size(m.as_str().trim_end_matches("/s")));
        let eta = caps.name("eta").and_then(|m| parse_eta(m.as_str()));
        on_event(DownloadEvent::Progress(DownloadProgress {
            percent,
            downloaded: None,
            total,
            speed_bps: speed,
            eta_seconds: eta,
        }));
        return;
    }
    if let Some(caps) = PERCENT_ONLY_RE.captures(line) {
        if let Some(percent) = caps.name("percent").and_then(|m| m.as_str().parse::<f64>().ok()) {
            on_event(DownloadEvent::Progress(DownloadProgress {
                percent: Some(percent),
                downloaded: None,
                total: None,
                speed_bps: None,
                eta_seconds: None,
            }));
            return;
        }
    }
    if let Some(caps) = FORMAT_HINT_RE.captures(line) {
        let id = caps
            .name("id")
            .or_else(|| caps.name("id2"))
            .map(|m| m.as_str().to_string());
        if let Some(id) = id {
            on_event(DownloadEvent::FormatHint(id));
        }
    }
}

fn parse_eta(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.len() {
        1 => parts[0].parse().ok(),
        2 => {
            let m: u64 = parts[0].parse().ok()?;
            let sec: u64 = parts[1].parse().ok()?;
            Some(m * 60 + sec)
        }
        3 => {
            let h: u64 = parts[0].parse().ok()?;
            let m: u64 = parts[1].parse().ok()?;
            let sec: u64 = parts[2].parse().ok()?;
            Some(h * 3600 + m * 60 + sec)
        }
        _ => None,
    }
}

/// Sanitizes a filename template per §6: trim, reset to default when empty,
/// strip path separators and disallowed characters per segment while
/// preserving `/` as a directory separator.
pub fn sanitize_filename_template(template: &str, default: &str) -> String {
    let trimmed = template.trim();
    let effective = if trimmed.is_empty() { default } else { trimmed };

    effective
        .split('/')
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("/")
        .trim_start_matches('/')
        .to_string()
}

fn sanitize_segment(segment: &str) -> String {
    let replaced: String = segment
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '-',
            '\\' => '-',
            other => other,
        })
        .collect();
    replaced
        .trim_end_matches(['.', ' '])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_parses_hms_and_ms_and_s() {
        assert_eq!(parse_eta("1:02:03"), Some(3723));
        assert_eq!(parse_eta("2:30"), Some(150));
        assert_eq!(parse_eta("45"), Some(45));
    }

    #[test]
    fn sanitize_template_falls_back_to_default_when_blank() {
        let result = sanitize_filename_template("   ", "%(title)s via VidBee.%(ext)s");
        assert_eq!(result, "%(title)s via VidBee.%(ext)s");
    }

    #[test]
    fn sanitize_template_strips_unsafe_chars_per_segment() {
        let result = sanitize_filename_template("sub:dir/na|me?.ext", "default");
        assert_eq!(result, "sub-dir/na-me-.ext");
    }

    #[test]
    fn fallback_progress_line_parses_percent_and_total() {
        let mut seen = None;
        handle_stdout_line(
            "[download]  45.2% of ~120.5MiB",
            &|event| {
                if let DownloadEvent::Progress(p) = event {
                    seen = Some(p);
                }
            },
        );
        let p = seen.unwrap();
        assert_eq!(p.percent, Some(45.2));
        assert!(p.total.is_some());
    }
}
