use clap::{Parser, ValueEnum};
use inat_trails_lib::{ICONIC_TAXA, QualityGrade};
use std::path::PathBuf;
use std::time::Duration;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum GradeArg {
    All,
    Casual,
    NeedsId,
    Research,
}

impl GradeArg {
    /// `None` stands for all grades
    pub fn quality_grade(self) -> Option<QualityGrade> {
        match self {
            GradeArg::All => None,
            GradeArg::Casual => Some(QualityGrade::Casual),
            GradeArg::NeedsId => Some(QualityGrade::NeedsId),
            GradeArg::Research => Some(QualityGrade::Research),
        }
    }
}

fn parse_iconic_taxon(value: &str) -> Result<String, String> {
    if value == "all" {
        return Ok(value.to_string());
    }
    ICONIC_TAXA
        .iter()
        .find(|taxon| taxon.eq_ignore_ascii_case(value))
        .map(|taxon| taxon.to_string())
        .ok_or_else(|| format!("expected all or one of {}", ICONIC_TAXA.join(", ")))
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// iNat Trails - iNaturalist observations along a hiking track, matched to the nearest named trail
pub struct Settings {
    /// GPX files with the recorded track
    #[clap(value_name = "GPX_FILE", required = true)]
    pub gpx_files: Vec<PathBuf>,

    /// Observation quality grade
    #[clap(long, value_enum, default_value = "research")]
    pub quality_grade: GradeArg,

    /// Iconic taxon, e.g. Plantae or Aves
    #[clap(long, default_value = "all", value_parser = parse_iconic_taxon)]
    pub iconic_taxon: String,

    /// Only observations from this month and the previous and next months
    #[clap(long)]
    pub month: bool,

    /// Show login names instead of real names of observers
    #[clap(long)]
    pub login_names: bool,

    /// Cache directory (default: the platform cache directory)
    #[clap(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Timeout of a single HTTP call in seconds
    #[clap(long, default_value = "60")]
    pub request_timeout: u64,

    /// Skip removing expired cache entries on startup
    #[clap(long)]
    pub no_sweep: bool,

    /// Waypoint file to write (default: first GPX file with `_observations.gpx`)
    #[clap(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl Settings {
    pub fn from_cli() -> Self {
        Settings::parse()
    }

    /// `None` stands for all iconic taxa
    pub fn iconic_taxon(&self) -> Option<&str> {
        (self.iconic_taxon != "all").then_some(self.iconic_taxon.as_str())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn output_path(&self) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let first = self
            .gpx_files
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("track.gpx"));
        let stem = first
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());
        first.with_file_name(format!("{stem}_observations.gpx"))
    }
}
