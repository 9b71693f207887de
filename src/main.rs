// ============================================
// ImageSmith - main.rs
// ============================================
// CLI entry point.
//
// Commands:
//   imagesmith list <image.wim>
//       Enumerate the indices of a container.
//
//   imagesmith service <image.wim> [options]
//       Mount each selected index, run the requested stage(s), and
//       dismount with the configured commit policy.
//
//   imagesmith cleanup [--config FILE]
//       Prune stale mount directories and recover orphaned mounts.
// ============================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;

use imagesmith::registry::hives;
use imagesmith::{
    BatchOrchestrator, ConsoleProgress, Dism, HiveController, IndexFilter, MountDirAllocator,
    RegTool, ServicingConfig, SessionManager,
};

fn main() -> Result<()> {
    println!("============================================");
    println!("ImageSmith v{}", env!("CARGO_PKG_VERSION"));
    println!("============================================");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "list" => cmd_list(&args[1..]),
        "service" => cmd_service(&args[1..]),
        "cleanup" => cmd_cleanup(&args[1..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => bail!("Unknown command: {} (try 'imagesmith help')", other),
    }
}

fn print_usage() {
    println!(
        "\
Usage:
  imagesmith list <image.wim>
  imagesmith service <image.wim> [options]
  imagesmith cleanup [--config FILE] [--mount-root DIR]

Service options:
  --index N          Only service index N (repeatable)
  --read-only        Mount read-only (implies --discard)
  --discard          Discard changes instead of committing
  --append           Append the commit (multi-index containers)
  --force            Force mount-dir removal if dismount fails
  --config FILE      Load imagesmith.toml-style configuration
  --mount-root DIR   Override the mount root directory
  --probe            Read Windows version info from each image's
                     SOFTWARE hive and attach it to the summary
  --backup-hives DIR Copy each image's SOFTWARE and SYSTEM hives
                     to DIR before other processing
  --summary FILE     Write the batch result as JSON"
    );
}

// ============================================
// COMMANDS
// ============================================

fn cmd_list(args: &[String]) -> Result<()> {
    let image = args
        .first()
        .map(PathBuf::from)
        .context("list: missing image path")?;

    let backend = Dism;
    let indices = imagesmith::image::list_indices(&backend, &image)?;

    println!("Indices in {}:", image.display());
    for info in &indices {
        println!(
            "  {}: {} [{} {}] ({:.1} GB)",
            info.index,
            info.name,
            info.architecture,
            info.edition,
            info.size_bytes as f64 / 1_073_741_824.0
        );
    }
    Ok(())
}

struct ServiceArgs {
    image: PathBuf,
    indices: Vec<u32>,
    config: ServicingConfig,
    probe: bool,
    backup_dir: Option<PathBuf>,
    summary: Option<PathBuf>,
}

fn parse_service_args(args: &[String]) -> Result<ServiceArgs> {
    let mut image: Option<PathBuf> = None;
    let mut indices = Vec::new();
    let mut config: Option<ServicingConfig> = None;
    let mut mount_root: Option<PathBuf> = None;
    let mut read_only = false;
    let mut discard = false;
    let mut append = false;
    let mut force = false;
    let mut probe = false;
    let mut backup_dir = None;
    let mut summary = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--index" => {
                let value = iter.next().context("--index needs a value")?;
                indices.push(value.parse().context("--index must be a number")?);
            }
            "--read-only" => read_only = true,
            "--discard" => discard = true,
            "--append" => append = true,
            "--force" => force = true,
            "--probe" => probe = true,
            "--backup-hives" => {
                let value = iter.next().context("--backup-hives needs a value")?;
                backup_dir = Some(PathBuf::from(value));
            }
            "--summary" => {
                let value = iter.next().context("--summary needs a value")?;
                summary = Some(PathBuf::from(value));
            }
            "--config" => {
                let value = iter.next().context("--config needs a value")?;
                config = Some(ServicingConfig::load(&PathBuf::from(value))?);
            }
            "--mount-root" => {
                let value = iter.next().context("--mount-root needs a value")?;
                mount_root = Some(PathBuf::from(value));
            }
            other if !other.starts_with("--") && image.is_none() => {
                image = Some(PathBuf::from(other));
            }
            other => bail!("Unknown service option: {}", other),
        }
    }

    let mut config = config.unwrap_or_default();
    if let Some(root) = mount_root {
        config.mount_root = root;
    }
    if read_only {
        config.read_only = true;
        config.save_changes = false;
    }
    if discard {
        config.save_changes = false;
    }
    if append {
        config.append = true;
    }
    if force {
        config.force_unmount = true;
    }

    Ok(ServiceArgs {
        image: image.context("service: missing image path")?,
        indices,
        config,
        probe,
        backup_dir,
        summary,
    })
}

fn cmd_service(args: &[String]) -> Result<()> {
    let args = parse_service_args(args)?;
    args.config.validate()?;

    let backend = Arc::new(Dism);
    let sessions = SessionManager::new(backend.clone(), Arc::new(ConsoleProgress));
    let allocator = MountDirAllocator::new(&args.config);
    allocator.validate_root()?;

    // Enumerate, then narrow to the requested indices
    let all = imagesmith::image::list_indices(backend.as_ref(), &args.image)?;
    let selected = if args.indices.is_empty() {
        all
    } else {
        IndexFilter::only_indices(args.indices.clone()).apply(all)
    };
    if selected.is_empty() {
        bail!("No matching indices in {}", args.image.display());
    }
    println!(
        "Servicing {} index(es) of {}",
        selected.len(),
        args.image.display()
    );

    let hive_controller = HiveController::new(Arc::new(RegTool));
    let probe = args.probe;
    let backup_dir = args.backup_dir.clone();

    // The per-mount processing stage. Real deployments plug their own
    // collaborators in here; the CLI ships hive backup and a version probe.
    let mut stage =
        |session: &mut imagesmith::MountSession| -> imagesmith::Result<serde_json::Value> {
            let mut report = json!({});

            if let Some(dir) = &backup_dir {
                let dest = dir.join(format!("index_{}", session.image_index));
                let mut copied = Vec::new();
                for hive in [hives::SOFTWARE, hives::SYSTEM] {
                    let path = hive_controller.backup_hive(session, hive, &dest)?;
                    copied.push(path.display().to_string());
                }
                report["hive_backups"] = json!(copied);
            }

            if probe {
                let mut software = hive_controller.load(session, hives::SOFTWARE, false)?;
                let version_key = "Microsoft\\Windows NT\\CurrentVersion";
                report["product_name"] = json!(software.read_string(version_key, "ProductName")?);
                report["current_build"] =
                    json!(software.read_string(version_key, "CurrentBuild")?);
                software.unload()?;
            }

            Ok(report)
        };

    let orchestrator = BatchOrchestrator::new(&args.config, &allocator, &sessions);
    let result = orchestrator.process_all(&selected, &mut stage);

    println!("\nBatch summary:");
    println!("{}", result.summary());

    if let Some(path) = &args.summary {
        result.write_json(path)?;
        println!("Summary written to {}", path.display());
    }

    result.ensure_complete()?;
    Ok(())
}

fn cmd_cleanup(args: &[String]) -> Result<()> {
    let mut config = ServicingConfig::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a value")?;
                config = ServicingConfig::load(&PathBuf::from(path))?;
            }
            "--mount-root" => {
                let path = iter.next().context("--mount-root needs a value")?;
                config.mount_root = PathBuf::from(path);
            }
            other => bail!("Unknown cleanup option: {}", other),
        }
    }

    let sessions = SessionManager::new(Arc::new(Dism), Arc::new(ConsoleProgress));
    let allocator = MountDirAllocator::new(&config);

    println!("Recovering orphaned mounts...");
    sessions.cleanup_orphaned()?;

    println!(
        "Pruning stale mount directories under {}...",
        config.mount_root.display()
    );
    allocator.prune_stale(&sessions.active_mount_paths());

    println!("Cleanup finished");
    Ok(())
}
