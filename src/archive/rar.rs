//! RAR payloads are handed to an external decoder, the first one found on `PATH`.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info, warn};

use super::ArchiveError;

#[derive(Clone, Copy, Debug)]
pub struct Decoder {
    pub program: &'static str,
    style: ArgStyle,
}

#[derive(Clone, Copy, Debug)]
enum ArgStyle {
    Unrar,
    Unar,
    SevenZip,
}

pub const DEFAULT_DECODERS: &[Decoder] = &[
    Decoder {
        program: "unrar",
        style: ArgStyle::Unrar,
    },
    Decoder {
        program: "unar",
        style: ArgStyle::Unar,
    },
    Decoder {
        program: "7z",
        style: ArgStyle::SevenZip,
    },
];

impl Decoder {
    fn command(&self, archive: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(self.program);
        match self.style {
            ArgStyle::Unrar => {
                // unrar wants a trailing separator to treat the target as a directory.
                let mut target = dest.as_os_str().to_os_string();
                target.push(std::path::MAIN_SEPARATOR_STR);
                cmd.arg("x").arg("-o+").arg("-y").arg(archive).arg(target);
            }
            ArgStyle::Unar => {
                cmd.arg("-q").arg("-f").arg("-D").arg("-o").arg(dest).arg(archive);
            }
            ArgStyle::SevenZip => {
                let mut out = std::ffi::OsString::from("-o");
                out.push(dest.as_os_str());
                cmd.arg("x").arg("-y").arg(out).arg(archive);
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

pub fn extract(archive: &Path, dest: &Path, decoders: &[Decoder]) -> Result<(), ArchiveError> {
    for decoder in decoders {
        let output = match decoder.command(archive, dest).output() {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("rar: {} not installed", decoder.program);
                continue;
            }
            Err(err) => {
                return Err(ArchiveError::Decoder(format!(
                    "failed to run {}: {err}",
                    decoder.program
                )));
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_owned()
            } else {
                stderr.trim().to_owned()
            };
            warn!("rar: {} exited with {}", decoder.program, output.status);
            return Err(ArchiveError::Decoder(format!(
                "{} exited with {}: {detail}",
                decoder.program, output.status
            )));
        }
        info!("rar: extracted {} with {}", archive.display(), decoder.program);
        return Ok(());
    }

    let names: Vec<&str> = decoders.iter().map(|d| d.program).collect();
    Err(ArchiveError::MissingDecoder(names.join(", ")))
}
