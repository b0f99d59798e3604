use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::process;
use std::time::{Duration, Instant};
use tl_recon::config::{Cli, Commands};
use tl_recon::http::crawler::{CrawlConfig, Crawler};
use tl_recon::http::prober::{ProbeConfig, Prober};
use tl_recon::output;
use tl_recon::scanner::portscan::{PortScanConfig, PortScanner};
use tl_recon::scanner::resolver::{DnsResolver, ResolverConfig};
use tl_recon::scanner::subdomain::{SubdomainConfig, SubdomainScanner};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn print_banner() {
    let banner = r#"
  _______ __        _____
 |__   __| |      |  __ \
    | |  | |      | |__) |___  ___ ___  _ __
    | |  | |      |  _  // _ \/ __/ _ \| '_ \
    | |  | |____  | | \ \  __/ (_| (_) | | | |
    |_|  |______| |_|  \_\___|\___\___/|_| |_|
    TL-Recon v2.0.0 - 子域名 / 端口 / HTTP 侦察
    此工具由天禄实验室开发
    "#;
    eprintln!("{}", banner);
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn spinner(quiet: bool, message: &str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(500)
        .build()?;

    runtime.block_on(async_main(cli))
}

/// 配置阶段失败统一以退出码 1 结束。
fn config_error(e: impl std::fmt::Display) -> ! {
    eprintln!("配置错误: {:#}", e);
    process::exit(1);
}

async fn async_main(cli: Cli) -> Result<()> {
    if !cli.quiet {
        print_banner();
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止并输出已有结果");
            ctrl_c.cancel();
        }
    });

    let start = Instant::now();
    let output_args = cli.command.output().clone();
    let quiet = cli.quiet;

    let (name, found) = match cli.command {
        Commands::Subdomain(args) => {
            let config = SubdomainConfig::from_cli(args).unwrap_or_else(|e| config_error(e));
            let scanner = SubdomainScanner::new(config).unwrap_or_else(|e| config_error(e));
            let pb = spinner(quiet, "正在枚举子域名...");
            let results = scanner.enumerate_with_cancel(&cancel).await;
            finish(pb);
            let results = results?;
            output::output_results(&results, &output_args)?;
            ("subdomain", results.len())
        }
        Commands::Resolve(args) => {
            let names = args.names().unwrap_or_else(|e| config_error(e));
            let config = ResolverConfig::from_cli(&args).unwrap_or_else(|e| config_error(e));
            let resolver = DnsResolver::new(config).unwrap_or_else(|e| config_error(e));
            let pb = spinner(quiet, &format!("正在解析 {} 个名称...", names.len()));
            let results = resolver.resolve_with_cancel(&cancel, names).await;
            finish(pb);
            let results = results?;
            output::output_results(&results, &output_args)?;
            ("resolve", results.len())
        }
        Commands::Portscan(args) => {
            let config = PortScanConfig::from_cli(args).unwrap_or_else(|e| config_error(e));
            let scanner = PortScanner::new(config).unwrap_or_else(|e| config_error(e));
            let pb = spinner(quiet, &format!("正在扫描 {} 个任务...", scanner.total_jobs()));
            let results = scanner.scan_with_cancel(&cancel).await;
            finish(pb);
            let results = results?;
            output::output_results(&results, &output_args)?;
            ("portscan", results.len())
        }
        Commands::Probe(args) => {
            let config = ProbeConfig::from_cli(args).unwrap_or_else(|e| config_error(e));
            let prober = Prober::new(config).unwrap_or_else(|e| config_error(e));
            let pb = spinner(quiet, &format!("正在探测 {} 个目标...", prober.config().targets.len()));
            let results = prober.probe_with_cancel(&cancel).await;
            finish(pb);
            let results = results?;
            output::output_results(&results, &output_args)?;
            ("probe", results.len())
        }
        Commands::Crawl(args) => {
            let config = CrawlConfig::from_cli(args).unwrap_or_else(|e| config_error(e));
            let crawler = Crawler::new(config).unwrap_or_else(|e| config_error(e));
            let pb = spinner(quiet, "正在爬取...");
            let results = crawler.crawl_with_cancel(&cancel).await;
            finish(pb);
            let results = results?;
            output::output_results(&results, &output_args)?;
            ("crawl", results.len())
        }
    };

    if !quiet {
        output::print_summary(name, found, start.elapsed());
    }
    Ok(())
}

fn finish(pb: Option<ProgressBar>) {
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
}
