//! `afd-reinit`: staged status-area teardown (§4.H).

use afd_core::config::AfdConfig;
use afd_core::reinit::{self, TypesizeField};
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "afd-reinit")]
struct Args {
    work_dir: String,

    /// How deep to tear down (§4.H's staged levels).
    init_level: u32,

    /// Typesize fields the caller reports as changed, forcing removal of
    /// the files whose on-disk layout depends on them at level 8+.
    #[arg(long = "changed-field", value_enum)]
    changed_fields: Vec<ChangedField>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ChangedField {
    MaxHostnameLength,
    MaxFilenameLength,
    OffT,
    TimeT,
}

impl From<ChangedField> for TypesizeField {
    fn from(value: ChangedField) -> Self {
        match value {
            ChangedField::MaxHostnameLength => TypesizeField::MaxHostnameLength,
            ChangedField::MaxFilenameLength => TypesizeField::MaxFilenameLength,
            ChangedField::OffT => TypesizeField::OffT,
            ChangedField::TimeT => TypesizeField::TimeT,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AfdConfig::new(args.work_dir.clone().into());
    let changed: Vec<TypesizeField> = args.changed_fields.into_iter().map(Into::into).collect();

    let plan = reinit::plan_for_level(config.work_dir(), args.init_level, &changed);
    info!(init_level = args.init_level, files = plan.single_files.len(), globs = plan.glob_families.len(), "reinitialiser plan built");

    reinit::execute(config.work_dir(), &plan, args.init_level).await?;

    info!("reinitialisation complete");
    Ok(())
}
