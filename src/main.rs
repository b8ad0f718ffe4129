use std::{
    fs::File,
    io::{self, BufReader, Write},
    process::ExitCode,
};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info};

use easy_jbod::device::MemJbod;
use easy_jbod::jbod::{JbodClient, JbodDevice, Volume, DEFAULT_HOST, DEFAULT_PORT};
use easy_jbod::trace;

fn main() -> ExitCode {
    init_logger();

    let matches = cli().get_matches();

    let trace_path = matches
        .get_one::<String>("trace")
        .map(String::as_str)
        .unwrap_or_default();
    let cache_size = matches.get_one::<usize>("cache-size").copied();

    let result = if matches.get_flag("local") {
        info!("using in-memory JBOD");
        run(Volume::new(MemJbod::new()), trace_path, cache_size)
    } else {
        let host = matches
            .get_one::<String>("host")
            .map(String::as_str)
            .unwrap_or(DEFAULT_HOST);
        let port = server_port(&matches);
        match JbodClient::connect(host, port) {
            // 卷被 drop 时客户端随之断开
            Ok(client) => run(Volume::new(client), trace_path, cache_size),
            Err(e) => Err(format!("cannot connect to {}:{}: {}", host, port, e)),
        }
    };

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            error!("{} commands failed", failed);
            ExitCode::FAILURE
        }
        Err(msg) => {
            error!("{}", msg);
            ExitCode::FAILURE
        }
    }
}

fn cli() -> Command {
    Command::new("easy-jbod")
        .about("Replay a block workload against a remote JBOD through a block cache")
        .arg(
            Arg::new("trace")
                .required(true)
                .help("Trace file with one command per line"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .default_value(DEFAULT_HOST)
                .help("JBOD server address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16))
                .help("JBOD server port, the default JBOD port if absent"),
        )
        .arg(
            Arg::new("cache-size")
                .short('c')
                .long("cache-size")
                .value_parser(value_parser!(usize))
                .help("Number of cache entries (2..=4096), no cache if absent"),
        )
        .arg(
            Arg::new("local")
                .long("local")
                .action(ArgAction::SetTrue)
                .help("Use an in-memory JBOD instead of connecting to a server"),
        )
}

fn server_port(matches: &ArgMatches) -> u16 {
    matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or(DEFAULT_PORT)
}

/// 回放 trace, 返回失败的命令数
fn run<D: JbodDevice>(
    volume: Volume<D>,
    trace_path: &str,
    cache_size: Option<usize>,
) -> Result<usize, String> {
    if let Some(entries) = cache_size {
        volume
            .cache_create(entries)
            .map_err(|e| format!("cannot create cache: {}", e))?;
    }

    let file = File::open(trace_path).map_err(|e| format!("{}: {}", trace_path, e))?;
    let ops = trace::parse(BufReader::new(file)).map_err(|e| format!("{}: {}", trace_path, e))?;
    info!("{} commands in {}", ops.len(), trace_path);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let summary = trace::replay(&volume, &ops, &mut out).map_err(|e| e.to_string())?;
    out.flush().map_err(|e| e.to_string())?;

    if cache_size.is_some() {
        volume.cache_print_hit_rate();
    }
    Ok(summary.failed)
}

/// env_logger 默认输出 info 级别, 可以用 RUST_LOG 覆盖; 时间戳使用本地时间
fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
