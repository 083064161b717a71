//! Command line front end for keyrecon.
//!
//! `ptree` commands build and inspect a persistent prefix tree; `peer run`
//! serves and gossips the tree with the partners in a settings file.

#[cfg(feature = "net")]
use keyrecon::net::{Peer, Settings};
use keyrecon::{p_sks, PTreeConfig, PrefixTree, RedbStore, TreeError, Zp};
#[cfg(feature = "net")]
use std::sync::Arc;
#[cfg(feature = "net")]
use tokio::select;
use std::{
    env, fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: keyrecon <ptree|peer> ...");
    println!("  ptree <build|dump|stats> ...");
    #[cfg(feature = "net")]
    println!("  peer run --settings <file.json> --db <path>");
}

fn print_ptree_help() {
    println!("Usage: keyrecon ptree <build|dump|stats> --db <path> [--settings <file.json>]");
    println!("  build [--input <file>]   insert decimal elements, one per line (stdin by default)");
    println!("  dump                     print every node");
    println!("  stats                    print per-level node and element counts as JSON");
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyrecon=info".into()),
        )
        .with_target(false)
        .compact()
        .init();
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("ptree") => {
            let sub = args.next().unwrap_or_else(|| {
                print_ptree_help();
                std::process::exit(1);
            });
            handle_ptree(&sub, args.collect());
        }
        #[cfg(feature = "net")]
        Some("peer") => match args.next().as_deref() {
            Some("run") => cmd_peer_run(args.collect()),
            _ => fatal("Usage: keyrecon peer run --settings <file.json> --db <path>"),
        },
        Some("-h") | Some("--help") | None => print_help(),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

#[derive(Default)]
struct CommonArgs {
    db: Option<PathBuf>,
    settings: Option<PathBuf>,
    input: Option<PathBuf>,
}

fn parse_common(args: Vec<String>) -> CommonArgs {
    let mut parsed = CommonArgs::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            PathBuf::from(
                iter.next()
                    .unwrap_or_else(|| fatal(&format!("{flag} expects a value"))),
            )
        };
        match arg.as_str() {
            "--db" => parsed.db = Some(value("--db")),
            "--settings" => parsed.settings = Some(value("--settings")),
            "--input" => parsed.input = Some(value("--input")),
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    parsed
}

fn tree_config(settings: Option<&PathBuf>) -> PTreeConfig {
    settings.map(|path| load_tree_config(path)).unwrap_or_default()
}

#[cfg(feature = "net")]
fn load_tree_config(path: &Path) -> PTreeConfig {
    Settings::load(path)
        .unwrap_or_else(|err| fatal(&err.to_string()))
        .ptree
}

#[cfg(not(feature = "net"))]
fn load_tree_config(path: &Path) -> PTreeConfig {
    #[derive(serde::Deserialize, Default)]
    #[serde(default)]
    struct TreeOnly {
        ptree: PTreeConfig,
    }
    let data = fs::read_to_string(path)
        .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", path.display())));
    serde_json::from_str::<TreeOnly>(&data)
        .unwrap_or_else(|err| fatal(&format!("invalid settings JSON: {err}")))
        .ptree
}

fn open_tree(args: &CommonArgs) -> PrefixTree<RedbStore> {
    let db = args
        .db
        .as_ref()
        .unwrap_or_else(|| fatal("--db is required"));
    if let Some(parent) = db.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let store = RedbStore::open(db)
        .unwrap_or_else(|err| fatal(&format!("failed to open {}: {err}", db.display())));
    let mut tree = PrefixTree::new(tree_config(args.settings.as_ref()), store);
    tree.create()
        .unwrap_or_else(|err| fatal(&format!("failed to create tree: {err}")));
    tree
}

fn handle_ptree(sub: &str, tail: Vec<String>) {
    match sub {
        "-h" | "--help" => print_ptree_help(),
        "build" => cmd_ptree_build(parse_common(tail)),
        "dump" => cmd_ptree_dump(parse_common(tail)),
        "stats" => cmd_ptree_stats(parse_common(tail)),
        _ => {
            eprintln!("Unknown ptree subcommand: {sub}");
            std::process::exit(1);
        }
    }
}

fn cmd_ptree_build(args: CommonArgs) {
    let mut tree = open_tree(&args);
    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(fs::File::open(path).unwrap_or_else(|err| {
            fatal(&format!("failed to open {}: {err}", path.display()))
        }))),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let p = p_sks();
    let (mut added, mut skipped) = (0usize, 0usize);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.unwrap_or_else(|err| fatal(&format!("read error: {err}")));
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let z = Zp::parse(&p, line)
            .unwrap_or_else(|| fatal(&format!("line {}: not a decimal element: {line}", lineno + 1)));
        match tree.insert(&z) {
            Ok(()) => added += 1,
            Err(TreeError::DuplicateElement(_)) | Err(TreeError::SamplePointElement(_)) => skipped += 1,
            Err(err) => fatal(&format!("insert failed: {err}")),
        }
    }
    let total = tree
        .len()
        .unwrap_or_else(|err| fatal(&format!("failed to read root: {err}")));
    println!("added: {added}");
    println!("skipped: {skipped}");
    println!("elements: {total}");
}

fn cmd_ptree_dump(args: CommonArgs) {
    let tree = open_tree(&args);
    let result = tree.walk(|node| {
        let key = if node.key().is_empty() {
            "-".to_string()
        } else {
            node.key().to_string()
        };
        println!(
            "key={key} size={} leaf={} svalues=[{}]",
            node.size(),
            node.is_leaf(),
            node.svalues()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        for z in node.leaf_elements() {
            println!("  {}", hex::encode(z.to_bytes()));
        }
        Ok(())
    });
    if let Err(err) = result {
        fatal(&format!("dump failed: {err}"));
    }
}

fn cmd_ptree_stats(args: CommonArgs) {
    let tree = open_tree(&args);
    let stats = tree
        .stats()
        .unwrap_or_else(|err| fatal(&format!("stats failed: {err}")));
    let json = serde_json::to_string_pretty(&stats)
        .unwrap_or_else(|err| fatal(&format!("failed to encode stats: {err}")));
    println!("{json}");
}

#[cfg(feature = "net")]
fn cmd_peer_run(tail: Vec<String>) {
    let args = parse_common(tail);
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| fatal("--settings is required"));
    let settings = Settings::load(&settings_path).unwrap_or_else(|err| fatal(&err.to_string()));
    let tree = open_tree(&args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    runtime.block_on(async move {
        let (peer, mut recoveries) = Peer::new(settings, tree);
        let peer = Arc::new(peer);
        let mirror = peer.clone();
        // Without key storage attached, recovered digests go straight into
        // the tree.
        tokio::spawn(async move {
            while let Some(recover) = recoveries.recv().await {
                let partner = recover.hkp_addr().unwrap_or_default();
                tracing::info!(
                    evt = "recover",
                    %partner,
                    elements = recover.remote_elements.len(),
                    "recovered digests"
                );
                mirror.insert(recover.remote_elements.iter().cloned());
                recover.complete();
            }
        });
        match peer.start().await {
            Ok(Some(addr)) => tracing::info!(evt = "start", %addr, "peer running"),
            Ok(None) => tracing::info!(evt = "start", "peer running (gossip only)"),
            Err(err) => fatal(&format!("failed to start peer: {err}")),
        }
        let fault = select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::warn!(%err, "cannot listen for ctrl-c");
                }
                None
            }
            fault = peer.halted() => Some(fault),
        };
        peer.stop().await;
        if let Some(fault) = fault {
            fatal(&format!("recon peer halted: {fault}"));
        }
        let stats = peer.stats().snapshot();
        println!(
            "{}",
            serde_json::to_string(&stats).unwrap_or_else(|err| err.to_string())
        );
    });
}
