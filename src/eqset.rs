//! EQSET preset file parser/writer (spec §7).
//!
//! Format: a header line, then one `center_freq bandwidth db_gain` triple
//! per line, `#` for comments, and a `center_freq` of `0` marking the
//! preamp band instead of a real filter (grounded on the original
//! `equalizer.c`'s `load_eqset`/`save_eqset`). Numbers always use `.` as
//! the decimal point regardless of locale.

use camino::Utf8Path;
use color_eyre::{Result, Section, eyre::Context, eyre::eyre};

use crate::conversion::EqBand;

const HEADER: &str = "EQSET";

pub struct EqPreset {
    pub name: String,
    pub bands: Vec<EqBand>,
}

impl EqPreset {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err("Could not read eqset file")
            .with_note(|| format!("path: {path}"))?;
        let mut lines = text.lines();
        let header = lines.next().unwrap_or("").trim();
        if header != HEADER {
            return Err(eyre!("Not an EQSET file (expected header {HEADER:?}, got {header:?})"));
        }

        let mut bands = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let center_freq: f64 = parts
                .next()
                .ok_or_else(|| eyre!("Missing center_freq in eqset line: {line:?}"))?
                .parse()
                .wrap_err_with(|| format!("Invalid center_freq in line: {line:?}"))?;
            let bandwidth: f64 = parts
                .next()
                .ok_or_else(|| eyre!("Missing bandwidth in eqset line: {line:?}"))?
                .parse()
                .wrap_err_with(|| format!("Invalid bandwidth in line: {line:?}"))?;
            let gain_db: f64 = parts
                .next()
                .ok_or_else(|| eyre!("Missing dB gain in eqset line: {line:?}"))?
                .parse()
                .wrap_err_with(|| format!("Invalid dB gain in line: {line:?}"))?;
            bands.push(EqBand {
                center_freq,
                bandwidth,
                gain_db,
            });
        }

        let name = path
            .file_stem()
            .ok_or_else(|| eyre!("eqset path has no file name"))?
            .to_owned();
        Ok(Self { name, bands })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let mut text = format!("{HEADER}\n# {}\n", self.name);
        for band in &self.bands {
            text.push_str(&format!(
                "{} {} {}\n",
                format_decimal(band.center_freq),
                format_decimal(band.bandwidth),
                format_decimal(band.gain_db)
            ));
        }
        std::fs::write(path, text)
            .wrap_err("Could not write eqset file")
            .with_note(|| format!("path: {path}"))
    }
}

/// Formats with `.` as the decimal separator regardless of the process
/// locale, since Rust's float `Display` already does this (unlike C's
/// locale-sensitive `printf("%f")`, which `equalizer.c` has to special-case).
fn format_decimal(value: f64) -> String {
    format!("{value}")
}

/// Lists all `*.eqset` files in a directory, sorted by name (spec §7
/// `eq` subcommand: "list or describe the saved equalizer presets").
pub fn list_presets(dir: &Utf8Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .wrap_err("Could not read eqsets dir")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            (path.extension()?.to_str()? == "eqset")
                .then(|| path.file_stem()?.to_str().map(str::to_owned))
                .flatten()
        })
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("rock.eqset")).unwrap();

        let preset = EqPreset {
            name: "rock".into(),
            bands: vec![
                EqBand {
                    center_freq: 0.0,
                    bandwidth: 0.0,
                    gain_db: 3.0,
                },
                EqBand {
                    center_freq: 100.0,
                    bandwidth: 1.0,
                    gain_db: -2.5,
                },
            ],
        };
        preset.save(&path).unwrap();

        let loaded = EqPreset::load(&path).unwrap();
        assert_eq!(loaded.bands.len(), 2);
        assert_eq!(loaded.bands[0].center_freq, 0.0);
        assert_eq!(loaded.bands[1].gain_db, -2.5);
    }

    #[test]
    fn rejects_missing_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("bad.eqset")).unwrap();
        std::fs::write(&path, "not an eqset\n1 2 3\n").unwrap();
        assert!(EqPreset::load(&path).is_err());
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("c.eqset")).unwrap();
        std::fs::write(&path, "EQSET\n# a comment\n\n100 1.0 2.0\n").unwrap();
        let loaded = EqPreset::load(&path).unwrap();
        assert_eq!(loaded.bands.len(), 1);
    }
}
