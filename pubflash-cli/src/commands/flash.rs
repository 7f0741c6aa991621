//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pubflash::{FirmwareImages, FlashProgress, FlashStatus, ImageKind};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, LogTarget, attach_printer, open_session, use_fancy_output, with_connection};

/// Image files given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ImagePaths<'a> {
    pub bootloader: Option<&'a Path>,
    pub partition_table: Option<&'a Path>,
    pub application: Option<&'a Path>,
}

impl ImagePaths<'_> {
    fn entries(&self) -> [(ImageKind, Option<&Path>); 3] {
        [
            (ImageKind::Bootloader, self.bootloader),
            (ImageKind::PartitionTable, self.partition_table),
            (ImageKind::Application, self.application),
        ]
    }

    /// Read every given file into an image set.
    pub fn load(&self) -> Result<FirmwareImages> {
        let mut images = FirmwareImages::new();
        for (kind, path) in self.entries() {
            if let Some(path) = path {
                images = images
                    .load(kind, path)
                    .with_context(|| format!("Failed to load {} firmware {}", kind.name(), path.display()))?;
            }
        }
        if images.is_empty() {
            return Err(CliError::Usage(
                "No firmware images given; pass --bootloader, --partition-table or --application"
                    .to_string(),
            )
            .into());
        }
        Ok(images)
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Bar position for a progress snapshot.
fn bar_position(progress: &FlashProgress) -> u64 {
    progress.progress.clamp(0.0, 100.0).round() as u64
}

/// Flash the given images and disconnect.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, paths: &ImagePaths<'_>, no_erase: bool) -> Result<()> {
    let images = paths.load()?;
    let erase = !no_erase && config.erase_by_default();

    if !cli.quiet {
        eprintln!("{} Firmware images:", style("📦").cyan());
        for (kind, path) in paths.entries() {
            if let (Some(path), Some(data)) = (path, images.get(kind)) {
                eprintln!(
                    "    {} {} @ 0x{:05X} ({} bytes) {}",
                    style("•").dim(),
                    kind.name(),
                    kind.address(),
                    data.len(),
                    style(path.display()).dim()
                );
            }
        }
    }

    let session = open_session(cli, config)?;
    let pb = progress_bar(cli.quiet);
    if !cli.quiet {
        let target = if pb.is_hidden() {
            LogTarget::Stderr
        } else {
            LogTarget::Progress(pb.clone())
        };
        attach_printer(session.sink(), target);
    }

    let result = with_connection(cli, &session, |session| {
        session
            .flash(&images, erase, |progress| {
                pb.set_position(bar_position(progress));
                if progress.status != FlashStatus::Flashing {
                    pb.set_message(progress.status.to_string());
                }
            })
            .context("Flashing failed")
    });

    match &result {
        Ok(()) => {
            pb.finish_with_message("done");
            if !cli.quiet {
                eprintln!("{} Flash complete", style("✓").green());
            }
        },
        Err(_) => pb.abandon(),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_requires_an_image() {
        let err = ImagePaths::default().load().unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("firmware"));
    }

    #[test]
    fn test_load_reads_given_files() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.bin");
        fs::write(&app, [0xE9, 0x01, 0x02]).unwrap();

        let paths = ImagePaths {
            application: Some(&app),
            ..ImagePaths::default()
        };
        let images = paths.load().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images.get(ImageKind::Application), Some(&[0xE9, 0x01, 0x02][..]));
        assert!(images.get(ImageKind::Bootloader).is_none());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        let paths = ImagePaths {
            bootloader: Some(&missing),
            ..ImagePaths::default()
        };
        let err = paths.load().unwrap_err();
        assert!(format!("{err:#}").contains("Bootloader"));
    }

    #[test]
    fn test_bar_position_rounds_and_clamps() {
        assert_eq!(bar_position(&FlashProgress::at(FlashStatus::Flashing, 49.6)), 50);
        assert_eq!(bar_position(&FlashProgress::at(FlashStatus::Complete, 100.0)), 100);
        assert_eq!(bar_position(&FlashProgress::failed("boom")), 0);
    }
}
