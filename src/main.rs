#[cfg(all(target_env = "musl", target_arch = "x86_64"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context as _, Error};
use camino::Utf8PathBuf as PathBuf;
use clap::builder::{PossibleValuesParser, TypedValueParser as _};
use clap::Parser;
use indicatif as ia;
use std::{collections::BTreeSet, time::Duration};
use tracing_subscriber::filter::LevelFilter;
use vsget::{constraints::ConstraintOptions, download, extract, postprocess, presets, resolve, Arch};

const ARCHES: &[&str] = &["x86", "x64", "arm", "arm64"];
const ARCHITECTURE_VALUES: &[&str] = &["host", "x86", "x64", "arm", "arm64"];
const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];
const DEFAULT_LICENSE_URL: &str = "https://go.microsoft.com/fwlink/?LinkId=2086102";

fn setup_logger(json: bool, log_level: LevelFilter) -> Result<(), Error> {
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();
    env_filter = env_filter.add_directive(format!("vsget={log_level}").parse()?);

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(subscriber.json().finish())
            .context("failed to set default subscriber")?;
    } else {
        tracing::subscriber::set_global_default(subscriber.finish())
            .context("failed to set default subscriber")?;
    }

    Ok(())
}

fn parse_level(s: &str) -> Result<LevelFilter, Error> {
    s.parse::<LevelFilter>()
        .map_err(|_e| anyhow::anyhow!("failed to parse level '{s}'"))
}

#[allow(clippy::indexing_slicing)]
fn parse_duration(src: &str) -> Result<Duration, Error> {
    let suffix_pos = src.find(char::is_alphabetic).unwrap_or(src.len());
    let num: u64 = src[..suffix_pos].parse()?;
    let suffix = if suffix_pos == src.len() {
        "s"
    } else {
        &src[suffix_pos..]
    };

    Ok(match suffix {
        "ms" => Duration::from_millis(num),
        "s" | "S" => Duration::from_secs(num),
        "m" | "M" => Duration::from_secs(num * 60),
        "h" | "H" => Duration::from_secs(num * 60 * 60),
        s => anyhow::bail!("unknown duration suffix '{s}'"),
    })
}

/// Fetches and repacks the MSVC C++ toolchain and Windows SDK for use from
/// non-Windows hosts.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Doesn't display the prompt to accept the license.
    #[arg(long, env = "VSGET_ACCEPT_LICENSE")]
    accept_license: bool,
    /// The log level for messages at or above which they are emitted.
    #[arg(
        short = 'L',
        long = "log-level",
        default_value = "info",
        value_parser = PossibleValuesParser::new(LOG_LEVELS).map(|l| parse_level(&l).unwrap()),
    )]
    level: LevelFilter,
    /// Output log messages as json.
    #[arg(long)]
    json: bool,
    /// Use a temporary directory for cache and staging, discarded on exit.
    #[arg(long)]
    temp: bool,
    /// Directory used to persist the content-addressed download cache and
    /// staging tree. Defaults to `./.vsget-cache`.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// A VS manifest to use from a file or URL, instead of the official
    /// channel manifest.
    #[arg(long, conflicts_with_all = &["major", "channel"])]
    manifest: Option<PathBuf>,
    /// The major product version to retrieve (e.g. 17).
    #[arg(long, default_value = "17")]
    major: String,
    /// The product channel to use.
    #[arg(long, default_value = "release")]
    channel: String,
    /// Use the prerelease/insiders channel instead of `release`.
    #[arg(long)]
    preview: bool,
    /// Write the fetched manifest bytes to this path (or, if omitted,
    /// `<productDisplayVersion>.manifest`); never overwrites a file whose
    /// contents differ.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    save_manifest: Option<PathBuf>,
    /// Pin a specific MSVC two-level version (e.g. "17.8").
    #[arg(long)]
    msvc_version: Option<String>,
    /// Pin a specific Windows SDK version; every other SDK is ignored.
    #[arg(long)]
    sdk_version: Option<String>,
    /// Additional root package ids to select, beyond the default workload.
    packages: Vec<String>,
    /// Package ids to never select, even as a dependency.
    #[arg(long = "ignore")]
    ignore: Vec<String>,
    /// Select dependencies marked `Optional`.
    #[arg(long)]
    include_optional: bool,
    /// Skip dependencies marked `Recommended`.
    #[arg(long)]
    skip_recommended: bool,
    /// Only keep packages matching the host architecture.
    #[arg(
        long,
        default_value = "yes",
        value_parser = PossibleValuesParser::new(["yes", "no"]).map(|s| s == "yes"),
    )]
    only_host: bool,
    /// The host architecture; auto-detected if not specified.
    #[arg(
        long,
        value_parser = PossibleValuesParser::new(ARCHES).map(|s| s.parse::<Arch>().unwrap()),
    )]
    host_arch: Option<Arch>,
    /// The target architectures to include; `host` resolves to whatever
    /// `--host-arch` (or auto-detection) picks.
    #[arg(
        long,
        value_parser = PossibleValuesParser::new(ARCHITECTURE_VALUES),
        value_delimiter = ',',
        default_values_t = vec!["x86".to_owned(), "x64".to_owned(), "arm".to_owned(), "arm64".to_owned()],
    )]
    architecture: Vec<String>,
    /// Print every component id in the manifest and exit.
    #[arg(long)]
    list_packages: bool,
    /// Print every `Workload`-typed package id in the manifest and exit.
    #[arg(long)]
    list_workloads: bool,
    /// Print every `Component`-typed package id in the manifest and exit.
    #[arg(long)]
    list_components: bool,
    /// Print the dependency tree of the current selection, annotating
    /// dropped edges, and exit.
    #[arg(long)]
    print_deps_tree: bool,
    /// Print, for each selected package, the other selected packages
    /// depending on it, and exit.
    #[arg(long)]
    print_reverse_deps: bool,
    /// Print the ids of the currently selected packages, in sorted order,
    /// and exit.
    #[arg(long)]
    print_selection: bool,
    /// Print the resolved root package ids (the concrete MSVC toolchain and
    /// SDK component chosen for the given `--msvc-version`/`--sdk-version`)
    /// and exit.
    #[arg(long)]
    print_version: bool,
    /// Only download payloads into the cache; do not extract.
    #[arg(long)]
    only_download: bool,
    /// Extract payloads but skip the post-processing (relocation, casing,
    /// include rewriting, patches) step.
    #[arg(long)]
    only_unpack: bool,
    /// Keep the staging directory after post-processing instead of removing
    /// it.
    #[arg(long)]
    keep_unpack: bool,
    /// Disable patch application even if `--patches` is set.
    #[arg(long)]
    skip_patch: bool,
    /// A directory of `.patch`/`.remove` files mirroring the destination
    /// layout, applied after post-processing.
    #[arg(long)]
    patches: Option<PathBuf>,
    /// A directory containing pre-downloaded WDK MSI installers to unpack
    /// and merge into the destination alongside the SDK.
    #[arg(long)]
    with_wdk_installers: Option<PathBuf>,
    /// The final output directory. Required unless `--only-download` is set.
    #[arg(long)]
    dest: Option<PathBuf>,
    /// Timeout for a single payload download.
    #[arg(short, long, value_parser = parse_duration, default_value = "60s")]
    timeout: Duration,
    /// An HTTPS proxy to use for all requests.
    #[arg(long, env = "HTTPS_PROXY")]
    https_proxy: Option<String>,
    /// Number of concurrent download workers.
    #[arg(long, default_value_t = 5)]
    jobs: usize,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    setup_logger(args.json, args.level)?;

    let cwd = PathBuf::from_path_buf(std::env::current_dir().context("unable to retrieve cwd")?)
        .map_err(|pb| anyhow::anyhow!("cwd {} is not a valid utf-8 path", pb.display()))?;

    let draw_target = vsget::util::ProgressTarget::Stdout;

    let client = {
        let mut builder = ureq::AgentBuilder::new().timeout_read(args.timeout);
        if let Some(proxy) = &args.https_proxy {
            let proxy =
                ureq::Proxy::new(proxy).context("failed to parse https proxy address")?;
            builder = builder.proxy(proxy);
        }
        builder.build()
    };

    let ctx = if args.temp {
        vsget::Ctx::with_temp(draw_target, client)?
    } else {
        let cache_dir = args.cache_dir.clone().unwrap_or_else(|| cwd.join(".vsget-cache"));
        vsget::Ctx::with_dir(cache_dir, draw_target, client)?
    };

    let channel = if args.preview {
        if args.major.parse::<u32>().unwrap_or(17) < 18 {
            "pre"
        } else {
            "insiders"
        }
    } else {
        args.channel.as_str()
    };

    let manifest_pb = ia::ProgressBar::with_draw_target(Some(0), draw_target.into()).with_style(
        ia::ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{elapsed}] {msg}")
            .unwrap(),
    );
    manifest_pb.set_prefix("Manifest");

    let installer_manifest = vsget::manifest::get_manifest(
        &ctx,
        args.manifest.as_deref(),
        &args.major,
        channel,
        args.save_manifest.as_deref(),
        manifest_pb.clone(),
    )?;
    manifest_pb.finish_with_message("fetched");

    let host = args.host_arch.unwrap_or_else(Arch::host);
    let index = vsget::index::PackageIndex::build(installer_manifest.variants, host);

    let architectures: Vec<Arch> = args
        .architecture
        .iter()
        .map(|a| if a == "host" { host.as_str() } else { a.as_str() })
        .map(|a| a.parse::<Arch>())
        .collect::<Result<_, _>>()?;

    if args.list_packages {
        for id in index.ids() {
            println!("{id}");
        }
        return Ok(());
    }

    if args.list_workloads || args.list_components {
        let want = if args.list_workloads {
            "Workload"
        } else {
            "Component"
        };
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for variant in index.iter() {
            if variant.kind == want {
                ids.insert(variant.id.as_str());
            }
        }
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    }

    if !args.accept_license {
        let license_url = index
            .preferred("Microsoft.VisualStudio.Product.BuildTools")
            .and_then(|v| v.license_url())
            .unwrap_or(DEFAULT_LICENSE_URL);

        println!("Do you accept the license at {license_url} (yes | no)?");
        let mut accept = String::new();
        std::io::stdin().read_line(&mut accept)?;
        match accept.trim() {
            "yes" => tracing::info!("license accepted"),
            "no" => {
                tracing::info!("license not accepted, exiting");
                return Ok(());
            }
            other => anyhow::bail!("unknown response to license request '{other}'"),
        }
    }

    let target_arches: BTreeSet<Arch> = architectures.iter().copied().collect();
    let mut ignore: BTreeSet<String> = args.ignore.iter().map(|s| s.to_lowercase()).collect();

    let mut roots = presets::resolve_roots(
        &index,
        args.msvc_version.as_deref(),
        args.sdk_version.as_deref(),
        &target_arches,
        &mut ignore,
    )?;
    roots.extend(args.packages.iter().cloned());

    if args.print_version {
        for root in &roots {
            println!("{root}");
        }
        return Ok(());
    }

    let opts = ConstraintOptions {
        ignore,
        include_optional: args.include_optional,
        skip_recommended: args.skip_recommended,
        only_host: args.only_host,
        host,
        target_arches,
    };

    if args.print_deps_tree {
        resolve::print_deps_tree(&index, &roots, &opts);
        return Ok(());
    }

    let selection = resolve::aggregate(&index, &roots, &opts);

    if args.print_reverse_deps {
        resolve::print_reverse_deps(&selection);
        return Ok(());
    }

    if args.print_selection {
        print_selection_table(&selection.entries)?;
        return Ok(());
    }

    if !args.only_download {
        anyhow::ensure!(args.dest.is_some(), "--dest is required unless --only-download is set");
    }

    let mp = ia::MultiProgress::with_draw_target(draw_target.into());
    let mut tasks = Vec::new();
    for variant in &selection.entries {
        let key = resolve::PackageKey::new(variant);
        for payload in &variant.payloads {
            let pb = mp.add(
                ia::ProgressBar::with_draw_target(Some(payload.size.unwrap_or(0)), draw_target.into())
                    .with_prefix(payload.basename().to_owned())
                    .with_style(
                        ia::ProgressStyle::default_bar()
                            .template("{spinner:.green} {prefix:.bold} [{elapsed}] {wide_bar:.green} {bytes}/{total_bytes}")
                            .unwrap()
                            .progress_chars("█▇▆▅▄▃▂▁  "),
                    ),
            );
            tasks.push(download::DownloadTask {
                key: key.clone(),
                payload: payload.clone(),
                progress: pb,
            });
        }
    }

    let downloader = download::Downloader::new(ctx.client.clone(), ctx.cache_dir.clone())
        .with_only_download(args.only_download);
    let cancel = downloader.cancel_token();
    ctrlc_handler(cancel);

    let total_bytes = downloader.download_all(tasks, args.jobs)?;
    tracing::info!(bytes = total_bytes, "download complete");

    if args.only_download {
        return Ok(());
    }

    let staging = ctx.ensure_staging_dir()?;

    for variant in &selection.entries {
        let key = resolve::PackageKey::new(variant);
        extract_one(&ctx, &key, variant, &staging)?;
    }

    if args.only_unpack {
        return Ok(());
    }

    let dest = args.dest.expect("checked above");
    std::fs::create_dir_all(&dest).with_context(|| format!("unable to create '{dest}'"))?;

    postprocess::relocate_canonical(&staging, &dest)?;

    // Case-fold only the SDK surface that's actually consumed from a
    // non-Windows host: include/<sdkver>/{um,shared} and lib/<sdkver>/um/<arch>
    // for every requested target arch.
    let include_root = dest.join("Windows Kits/10/Include");
    if let Ok(sdk_versions) = std::fs::read_dir(&include_root) {
        for sdk_ver in sdk_versions.filter_map(Result::ok) {
            let Some(sdk_ver) = sdk_ver.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            for leaf in ["um", "shared"] {
                let subtree = include_root.join(&sdk_ver).join(leaf);
                if subtree.exists() {
                    postprocess::lowercase_tree(&subtree)?;
                    postprocess::rewrite_includes(&subtree)?;
                }
            }

            for arch in &architectures {
                let lib_subtree = dest
                    .join("Windows Kits/10/Lib")
                    .join(&sdk_ver)
                    .join("um")
                    .join(arch.as_str());
                if lib_subtree.exists() {
                    postprocess::lowercase_tree(&lib_subtree)?;
                }
            }
        }
    }

    if let Some(wdk_dir) = &args.with_wdk_installers {
        unpack_wdk(wdk_dir, &staging, &dest)?;
    }

    if !args.skip_patch {
        if let Some(patches_dir) = &args.patches {
            postprocess::apply_patches(&dest, patches_dir)?;
        }
    }

    if !args.keep_unpack {
        let _ = std::fs::remove_dir_all(&staging);
    }

    Ok(())
}

/// Prints the selected packages as a table of id/version/architecture/total
/// payload size, with a trailing total-size row.
fn print_selection_table(entries: &[vsget::manifest::Variant]) -> Result<(), Error> {
    use cli_table::{format::Justify, Cell, CellStruct, Style, Table};

    let mut total = 0u64;
    let mut rows: Vec<Vec<CellStruct>> = Vec::new();

    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    for variant in sorted {
        let size: u64 = variant.payloads.iter().filter_map(|p| p.size).sum();
        total += size;

        rows.push(vec![
            variant.id.clone().cell(),
            variant.version.clone().unwrap_or_default().cell(),
            variant
                .chip
                .clone()
                .or_else(|| variant.machine_arch.clone())
                .unwrap_or_default()
                .cell(),
            ia::HumanBytes(size).to_string().cell().justify(Justify::Right),
        ]);
    }

    rows.push(vec![
        "".cell(),
        "".cell(),
        "Total".cell(),
        ia::HumanBytes(total).to_string().cell().justify(Justify::Right),
    ]);

    let table = rows
        .table()
        .title(vec![
            "id".cell().bold(true),
            "version".cell().bold(true),
            "arch".cell().bold(true),
            "size".cell().bold(true),
        ]);

    cli_table::print_stdout(table).context("failed to print selection table")?;
    Ok(())
}

/// Installs a SIGINT/Ctrl-C handler that flips `cancel`, observed by download
/// workers at each chunk/attempt boundary, so an interrupted run unwinds
/// partial transfers instead of leaving a truncated cache file behind.
fn ctrlc_handler(cancel: download::CancelToken) {
    let result = ctrlc::set_handler(move || {
        tracing::warn!("UserCancel: interrupt received, cancelling in-flight downloads");
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    });
    if let Err(err) = result {
        tracing::debug!(%err, "unable to install Ctrl-C handler");
    }
}

fn extract_one(
    ctx: &vsget::Ctx,
    key: &resolve::PackageKey,
    variant: &vsget::manifest::Variant,
    staging: &PathBuf,
) -> Result<(), Error> {
    let lower_id = variant.id.to_lowercase();

    if matches!(variant.kind.as_str(), "Component" | "Workload" | "Group") {
        return Ok(());
    }

    let is_sdk = lower_id.starts_with("win10sdk") || lower_id.starts_with("win11sdk");

    let pkg_cache_dir = ctx.cache_dir.join(key.as_str());

    for payload in &variant.payloads {
        let payload_path = pkg_cache_dir.join(payload.basename());
        if !payload_path.exists() {
            continue;
        }

        let action = if is_sdk && payload.basename().to_lowercase().ends_with(".msi") {
            extract::ExtractAction::Msi {
                payload_path: &payload_path,
            }
        } else if payload.basename().to_lowercase().ends_with(".vsix")
            || payload.basename().to_lowercase().ends_with(".zip")
        {
            extract::ExtractAction::Vsix {
                payload_path: &payload_path,
            }
        } else {
            tracing::debug!(id = %variant.id, file = %payload.basename(), "no extractor for payload, skipping");
            continue;
        };

        extract::extract_variant(key, action, staging)?;
    }

    Ok(())
}

fn unpack_wdk(wdk_dir: &PathBuf, staging: &PathBuf, dest: &PathBuf) -> Result<(), Error> {
    for entry in std::fs::read_dir(wdk_dir).with_context(|| format!("unable to read '{wdk_dir}'"))? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.to_lowercase().starts_with("windows driver") || !name.to_lowercase().ends_with(".msi") {
            continue;
        }

        let msi_path = PathBuf::from_path_buf(path)
            .map_err(|p| anyhow::anyhow!("non-utf8 WDK installer path '{}'", p.display()))?;
        let wdk_staging = staging.join("wdk");
        let listing = wdk_staging.join(format!("{name}-listing.txt"));
        extract::extract_msi(&msi_path, &wdk_staging, &listing)?;
    }

    // The WDK MSIs extract a `Build`/`build` split that differs only in
    // case; mergeTrees collapses that automatically once relocated.
    let wdk_staging = staging.join("wdk");
    if wdk_staging.exists() {
        let target = dest.join("WDK");
        extract::merge_trees(&wdk_staging, &target)?;
    }

    Ok(())
}
