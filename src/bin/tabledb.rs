use std::path::Path;
use tabledb::offline;

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
        "dump" => cmd_dump(&args[2..]),
        "verify" => cmd_verify(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_dump(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let key = parse_flag_value(args, "--key").ok_or("--key is required")?;
    let dump = offline::dump_log(Path::new(&dir), &key).map_err(|e| format!("dump: {e}"))?;
    for row in &dump.rows {
        let line = serde_json::json!({
            "key": row.key.replace('\0', "/"),
            "seq": row.seq,
            "value": row.value,
        });
        println!("{line}");
    }
    eprintln!(
        "ok\t{}\towned={}\tversion={}\trows={}",
        dump.key,
        dump.owned,
        dump.version,
        dump.rows.len()
    );
    if let Some(damage) = dump.damage {
        eprintln!("warning: damaged tail: {damage}");
    }
    Ok(())
}

fn cmd_verify(args: &[String]) -> Result<(), String> {
    let dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let reports = offline::verify_dir(Path::new(&dir)).map_err(|e| format!("verify: {e}"))?;
    let mut failed = 0;
    for report in &reports {
        let status = if report.ok() { "ok" } else { "DAMAGED" };
        println!(
            "{status}\t{}\t{}\t{}\t{}/{}\t{}",
            report.file,
            report.kind,
            report.frames,
            report.valid_len,
            report.file_len,
            report.damage.as_deref().unwrap_or("-")
        );
        if !report.ok() {
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(format!("{failed} of {} files damaged", reports.len()));
    }
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

fn print_usage() {
    eprintln!(
        "usage:\n  tabledb dump --dir <store-dir> --key <log-key>\n  tabledb verify --dir <store-dir>"
    );
}
