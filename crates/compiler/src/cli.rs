//! CLI wiring for kernelvault.

use crate::config::{GeneratorConfig, LockStrategy, TargetMode};
use crate::context::StopFlag;
use crate::generator::Generator;
use crate::replay::{load_entries, Replayer};
use crate::report::RunReport;
use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use kernelvault_backend::ReferenceBackend;
use kernelvault_catalog::{describe, duplicate_groups, Field, KernelCatalog};
use kernelvault_ir::frontend::SizeBindings;
use kernelvault_ir::{parse, CudaDim, MappingOptions, ShapeSignature};
use kernelvault_search::WorkloadFamily;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "kernelvault",
    about = "Ahead-of-time kernel search and catalog toolkit"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum FamilyArg {
    GroupConvolution,
    GroupNormalization,
    Mlp3,
    Wavenet,
}

impl From<FamilyArg> for WorkloadFamily {
    fn from(value: FamilyArg) -> WorkloadFamily {
        match value {
            FamilyArg::GroupConvolution => WorkloadFamily::GroupConvolution,
            FamilyArg::GroupNormalization => WorkloadFamily::GroupNormalization,
            FamilyArg::Mlp3 => WorkloadFamily::Mlp3,
            FamilyArg::Wavenet => WorkloadFamily::WaveNet,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum LockArg {
    Global,
    PerShape,
}

impl From<LockArg> for LockStrategy {
    fn from(value: LockArg) -> LockStrategy {
        match value {
            LockArg::Global => LockStrategy::Global,
            LockArg::PerShape => LockStrategy::PerShape,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum TargetArg {
    Shared,
    PerShape,
}

impl From<TargetArg> for TargetMode {
    fn from(value: TargetArg) -> TargetMode {
        match value {
            TargetArg::Shared => TargetMode::Shared,
            TargetArg::PerShape => TargetMode::PerShape,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search (shape, options) pairs for a workload and catalog accepted kernels.
    Generate(GenerateArgs),
    /// Compile an explicit JSON list of (inputs, options) pairs.
    Replay {
        #[arg(long, value_enum)]
        family: FamilyArg,
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "kernels.json")]
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        threads: usize,
    },
    /// Print the catalog size or one field of a cataloged kernel.
    Inspect(InspectArgs),
    /// Print groups of kernel ids whose sources are identical.
    Duplicates {
        #[arg(long)]
        input: PathBuf,
    },
    /// Print reference kernels for every definition of a program file.
    Emit {
        #[arg(long)]
        program: PathBuf,
        /// Size bindings such as `N=14,K=3`.
        #[arg(long, default_value = "")]
        sizes: String,
        /// Emit only this definition.
        #[arg(long)]
        entry: Option<String>,
    },
}

/// Flags override the matching fields of `--config`.
#[derive(Args, Debug, Default)]
pub struct GenerateArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub family: Option<FamilyArg>,
    /// Number of distinct input shapes.
    #[arg(long)]
    pub number_inputs: Option<usize>,
    /// Number of options per input shape.
    #[arg(long)]
    pub number_options: Option<usize>,
    #[arg(long)]
    pub threads: Option<usize>,
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub checkpoint_every: Option<u64>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub min_blocks: Option<u64>,
    #[arg(long, value_enum)]
    pub lock: Option<LockArg>,
    #[arg(long, value_enum)]
    pub target_mode: Option<TargetArg>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Timed-out compilations allowed to keep running before new ones fail.
    #[arg(long)]
    pub max_abandoned: Option<usize>,
    /// Also write a JSON run report here.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl GenerateArgs {
    pub fn to_config(&self) -> Result<GeneratorConfig> {
        let mut config = match &self.config {
            Some(path) => GeneratorConfig::load_from_file(path)?,
            None => GeneratorConfig::default(),
        };
        if let Some(family) = self.family {
            config.family = family.into();
        }
        if let Some(shapes) = self.number_inputs {
            config.shapes = shapes;
        }
        if let Some(options) = self.number_options {
            config.options_per_shape = options;
        }
        if let Some(threads) = self.threads {
            config.workers = threads;
        }
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(every) = self.checkpoint_every {
            config.checkpoint_every = every;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.min_blocks.is_some() {
            config.min_blocks = self.min_blocks;
        }
        if let Some(lock) = self.lock {
            config.lock_strategy = lock.into();
        }
        if let Some(mode) = self.target_mode {
            config.target_mode = mode.into();
        }
        if self.timeout_ms.is_some() {
            config.compile_timeout_ms = self.timeout_ms;
        }
        if let Some(limit) = self.max_abandoned {
            config.max_abandoned_compiles = limit;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("field").multiple(false)))]
pub struct InspectArgs {
    #[arg(long)]
    pub input: PathBuf,
    /// Index of the record to inspect.
    #[arg(long, default_value_t = 0)]
    pub idx: usize,
    #[arg(long, group = "field")]
    pub size: bool,
    #[arg(long, group = "field")]
    pub block: bool,
    #[arg(long, group = "field")]
    pub grid: bool,
    #[arg(long, group = "field")]
    pub params: bool,
    #[arg(long, group = "field")]
    pub options: bool,
    #[arg(long, group = "field")]
    pub id: bool,
    #[arg(long, group = "field")]
    pub ninputs: bool,
    #[arg(long, group = "field")]
    pub noutputs: bool,
    #[arg(long, group = "field")]
    pub sname: bool,
}

impl InspectArgs {
    pub fn field(&self) -> Field {
        let selected = [
            (self.size, Field::Size),
            (self.block, Field::Block),
            (self.grid, Field::Grid),
            (self.params, Field::Params),
            (self.options, Field::Options),
            (self.id, Field::Id),
            (self.ninputs, Field::Inputs),
            (self.noutputs, Field::Outputs),
            (self.sname, Field::SpecializedName),
        ];
        selected
            .into_iter()
            .find_map(|(set, field)| set.then_some(field))
            .unwrap_or_default()
    }
}

/// Parse `N=14,K=3` into size bindings.
pub fn parse_sizes(text: &str) -> Result<SizeBindings> {
    let mut sizes = SizeBindings::default();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("size binding `{pair}` is not NAME=VALUE"))?;
        let value: u64 = value
            .trim()
            .parse()
            .with_context(|| format!("size `{}` is not a non-negative integer", name.trim()))?;
        sizes.bind(name.trim(), value)?;
    }
    Ok(sizes)
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Generate(args) => {
            let config = args.to_config()?;
            let stop = StopFlag::new();
            let handler_stop = stop.clone();
            ctrlc::set_handler(move || handler_stop.request_stop())
                .context("failed to install signal handler")?;

            let generator = Generator::from_config(&config, Arc::new(ReferenceBackend), stop)?;
            let summary = generator.run()?;
            if let Some(path) = &args.report {
                RunReport::new(&generator, summary.clone()).write_to(path)?;
                info!(path = %path.display(), "run report written");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Replay {
            family,
            input,
            output,
            threads,
        } => {
            let family = WorkloadFamily::from(family);
            let entries = load_entries(&input)?;
            let replayer = Replayer::new(
                family.program(),
                family.entry_point(),
                Arc::new(ReferenceBackend),
                threads,
            );
            let summary = replayer.run(&entries, &output)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Inspect(args) => {
            let catalog = KernelCatalog::load_from_file(&args.input)?;
            println!("{}", describe(&catalog, args.field(), args.idx)?);
        }
        Command::Duplicates { input } => {
            let catalog = KernelCatalog::load_from_file(&input)?;
            for group in duplicate_groups(&catalog) {
                let ids: Vec<String> = group.iter().map(u64::to_string).collect();
                println!("{}", ids.join(" "));
            }
        }
        Command::Emit {
            program,
            sizes,
            entry,
        } => {
            let text = fs::read_to_string(&program)
                .with_context(|| format!("failed to read {}", program.display()))?;
            let parsed = parse(&text)?;
            let sizes = parse_sizes(&sizes)?;
            if let Some(name) = &entry {
                if parsed.definition(name).is_none() {
                    bail!("`{name}` is not defined in {}", program.display());
                }
            }
            let options = MappingOptions::naive()
                .with_block(CudaDim::unit())
                .with_grid(CudaDim::unit());
            let backend = ReferenceBackend::new();
            for def in &parsed.definitions {
                if entry.as_deref().is_some_and(|name| name != def.name) {
                    continue;
                }
                let inputs = def
                    .instantiate_inputs(&sizes)
                    .with_context(|| format!("cannot instantiate `{}`", def.name))?;
                let kernel =
                    backend.compile_definition(def, &ShapeSignature::new(inputs), &options)?;
                println!("{}", kernel.source);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sizes() {
        let sizes = parse_sizes("N=14, K=3").unwrap();
        assert_eq!(sizes.get("N"), Some(14));
        assert_eq!(sizes.get("K"), Some(3));
        assert!(parse_sizes("").unwrap().is_empty());
        assert!(parse_sizes("N").is_err());
        assert!(parse_sizes("N=x").is_err());
        assert!(parse_sizes("N=1,N=2").is_err());
    }

    #[test]
    fn test_generate_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "kernelvault",
            "generate",
            "--family",
            "wavenet",
            "--number-inputs",
            "4",
            "--lock",
            "per-shape",
            "--seed",
            "12",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.family, WorkloadFamily::WaveNet);
        assert_eq!(config.shapes, 4);
        assert_eq!(config.options_per_shape, 10);
        assert_eq!(config.lock_strategy, LockStrategy::PerShape);
        assert_eq!(config.seed, Some(12));
    }

    #[test]
    fn test_inspect_allows_one_field() {
        let cli = Cli::try_parse_from(["kernelvault", "inspect", "--input", "k.json", "--grid"])
            .unwrap();
        let Command::Inspect(args) = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(args.field(), Field::Grid);

        assert!(Cli::try_parse_from([
            "kernelvault",
            "inspect",
            "--input",
            "k.json",
            "--grid",
            "--block"
        ])
        .is_err());
    }
}
