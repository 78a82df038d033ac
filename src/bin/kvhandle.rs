use kvhandle::{
    HandleRuntime, IterStep, IteratorAction, IteratorRef, ReadOptions, RuntimeConfig,
    SnapshotChoice, StoreConfig,
};
use std::path::{Path, PathBuf};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "fill" => cmd_fill(&args[2..]),
        "scan" => cmd_scan(&args[2..]),
        "count" => cmd_count(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_fill(args: &[String]) -> Result<(), String> {
    let dir = parse_dir(args)?;
    let count: u64 = parse_number(args, "--count")?.ok_or("--count is required")?;
    let value_size = parse_number(args, "--value-size")?.unwrap_or(32usize);
    let runtime = open_runtime()?;
    let store = runtime
        .open_store(&dir, StoreConfig::create_if_missing())
        .map_err(|e| format!("open {}: {e}", dir.display()))?;
    let mut value = vec![0u8; value_size];
    for n in 0..count {
        let key = n.to_be_bytes();
        for (i, byte) in value.iter_mut().enumerate() {
            *byte = key[i % key.len()] ^ (i as u8);
        }
        runtime
            .put(store, &key, &value)
            .map_err(|e| format!("put: {e}"))?;
    }
    runtime.shutdown();
    println!("ok\t{}\t{count}", dir.display());
    Ok(())
}

fn cmd_scan(args: &[String]) -> Result<(), String> {
    let dir = parse_dir(args)?;
    let from = parse_flag_value(args, "--from")
        .map(|h| hex::decode(h).map_err(|e| format!("invalid --from: {e}")))
        .transpose()?;
    let limit = parse_number(args, "--limit")?.unwrap_or(usize::MAX);
    let keys_only = args.iter().any(|a| a == "--keys-only");
    let (runtime, iterator) = open_iterator(&dir, keys_only)?;
    let first = match from {
        Some(key) => IteratorAction::Seek(key),
        None => IteratorAction::First,
    };
    let action = step_action(args);
    let mut step = runtime
        .iterator_move(iterator, first)
        .map_err(|e| format!("iterator: {e}"))?;
    let mut printed = 0usize;
    while printed < limit {
        let IterStep::Entry { key, value } = step else {
            break;
        };
        match value {
            Some(value) => println!("{}\t{}", hex::encode(key), hex::encode(value)),
            None => println!("{}", hex::encode(key)),
        }
        printed += 1;
        step = runtime
            .iterator_move(iterator, action.clone())
            .map_err(|e| format!("iterator: {e}"))?;
    }
    runtime.shutdown();
    Ok(())
}

fn cmd_count(args: &[String]) -> Result<(), String> {
    let dir = parse_dir(args)?;
    let (runtime, iterator) = open_iterator(&dir, true)?;
    let action = step_action(args);
    let mut count = 0u64;
    loop {
        let step = runtime
            .iterator_move(iterator, action.clone())
            .map_err(|e| format!("iterator: {e}"))?;
        if step.is_exhausted() {
            break;
        }
        count += 1;
    }
    let stats = runtime.stats();
    runtime.shutdown();
    println!(
        "ok\t{count}\t{}\t{}",
        stats.completed_prefetch_jobs, stats.invariant_violations
    );
    Ok(())
}

fn open_runtime() -> Result<HandleRuntime, String> {
    HandleRuntime::in_memory(RuntimeConfig::default()).map_err(|e| format!("runtime: {e}"))
}

fn open_iterator(dir: &Path, keys_only: bool) -> Result<(HandleRuntime, IteratorRef), String> {
    let runtime = open_runtime()?;
    let store = runtime
        .open_store(dir, StoreConfig::read_only())
        .map_err(|e| format!("open {}: {e}", dir.display()))?;
    let iterator = runtime
        .open_iterator(
            store,
            keys_only,
            ReadOptions {
                snapshot: SnapshotChoice::Fresh,
                ..ReadOptions::default()
            },
        )
        .map_err(|e| format!("open iterator: {e}"))?;
    Ok((runtime, iterator))
}

fn step_action(args: &[String]) -> IteratorAction {
    if args.iter().any(|a| a == "--prefetch") {
        IteratorAction::Prefetch
    } else {
        IteratorAction::Next
    }
}

fn parse_dir(args: &[String]) -> Result<PathBuf, String> {
    parse_flag_value(args, "--dir")
        .map(PathBuf::from)
        .ok_or_else(|| "--dir is required".into())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn parse_number<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    parse_flag_value(args, flag)
        .map(|raw| raw.parse::<T>().map_err(|e| format!("invalid {flag}: {e}")))
        .transpose()
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  kvhandle fill --dir <store-dir> --count <n> [--value-size <bytes>]");
    eprintln!(
        "  kvhandle scan --dir <store-dir> [--from <hex-key>] [--limit <n>] [--keys-only] [--prefetch]"
    );
    eprintln!("  kvhandle count --dir <store-dir> [--prefetch]");
}
