use crate::http::crawler::CrawlConfig;
use crate::http::prober::ProbeConfig;
use crate::output::OutputFormat;
use crate::scanner::portscan::PortScanConfig;
use crate::scanner::resolver::{ResolverConfig, DEFAULT_RESOLVERS};
use crate::scanner::subdomain::SubdomainConfig;
use crate::target::{expand_hosts, load_targets};
use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "tl-recon")]
#[command(version)]
#[command(about = "TL-Recon - 子域名枚举 / 端口扫描 / HTTP 探测 / 爬取", long_about = None)]
#[command(after_help = "警告：本工具只允许在取得授权的前提下用于内部资产摸排、攻防演练、渗透测试等合法场景。禁止对未授权目标进行扫描。")]
pub struct Cli {
    /// 日志详细程度 (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// 不显示横幅与进度
    #[arg(short, long, global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 子域名枚举 (被动数据源 + 字典爆破)
    Subdomain(SubdomainArgs),
    /// 批量解析子域名，仅输出存活记录
    Resolve(ResolveArgs),
    /// TCP 端口扫描
    Portscan(PortscanArgs),
    /// HTTP(S) 存活探测
    Probe(ProbeArgs),
    /// 网页爬取
    Crawl(CrawlArgs),
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// 输出文件，缺省写到标准输出
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct SubdomainArgs {
    #[arg(short = 'd', long, value_name = "DOMAIN")]
    pub domain: String,
    #[arg(short = 'w', long, value_name = "FILE")]
    pub wordlist: Option<PathBuf>,
    #[arg(short = 'c', long, default_value = "100")]
    pub concurrency: usize,
    /// 被动数据源请求超时 (秒)
    #[arg(short = 't', long, default_value = "30")]
    pub timeout: u64,
    #[arg(long)]
    pub no_passive: bool,
    #[arg(long)]
    pub bruteforce: bool,
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub resolvers: Vec<String>,
    /// 整体时限 (分钟)
    #[arg(long, value_name = "MIN", default_value = "30")]
    pub deadline: u64,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    #[arg(short = 'l', long, value_name = "TARGET|FILE")]
    pub list: String,
    #[arg(short = 'c', long, default_value = "100")]
    pub concurrency: usize,
    /// 单次查询超时 (秒)
    #[arg(short = 't', long, default_value = "5")]
    pub timeout: u64,
    #[arg(long, default_value = "2")]
    pub retries: u32,
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub resolvers: Vec<String>,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PortscanArgs {
    /// 目标：主机、CIDR、IP 范围或列表文件
    #[arg(short = 't', long, value_name = "TARGET|FILE")]
    pub target: String,
    #[arg(short = 'p', long, default_value = "1-1000")]
    pub ports: String,
    #[arg(short = 'c', long, default_value = "300")]
    pub concurrency: usize,
    /// 单端口连接超时 (秒)
    #[arg(long, default_value = "3")]
    pub timeout: u64,
    #[arg(long, default_value = "1000")]
    pub rate: f64,
    /// 服务识别
    #[arg(long = "sV")]
    pub service_detect: bool,
    /// 深度服务识别 (版本与产品)
    #[arg(long)]
    pub deep: bool,
    #[arg(long, value_name = "PORTS")]
    pub exclude_ports: Option<String>,
    #[arg(long, value_name = "MIN", default_value = "30")]
    pub deadline: u64,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[arg(short = 'l', long, value_name = "TARGET|FILE")]
    pub list: String,
    #[arg(short = 'c', long, default_value = "100")]
    pub concurrency: usize,
    #[arg(short = 't', long, default_value = "10")]
    pub timeout: u64,
    #[arg(long)]
    pub no_follow: bool,
    #[arg(long, default_value = "5")]
    pub max_redirects: usize,
    #[arg(long)]
    pub tls_verify: bool,
    #[arg(long, default_value = "2")]
    pub retries: u32,
    #[arg(long, default_value = "500")]
    pub rate: f64,
    /// 按响应延迟自动调整速率
    #[arg(long)]
    pub adaptive: bool,
    /// 自定义请求头，格式 'Name: Value'，可重复
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,
    /// 附加响应深度分析
    #[arg(long)]
    pub analyze: bool,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    #[arg(short = 'u', long, value_name = "URL|FILE")]
    pub url: String,
    #[arg(long, default_value = "3")]
    pub depth: usize,
    #[arg(long, default_value = "1000")]
    pub max_urls: usize,
    #[arg(short = 'c', long, default_value = "20")]
    pub concurrency: usize,
    #[arg(short = 't', long, default_value = "10")]
    pub timeout: u64,
    #[arg(long, default_value = "50")]
    pub rate: f64,
    /// 单主机速率，0 表示不限制
    #[arg(long, value_name = "R", default_value = "0")]
    pub host_rate: f64,
    #[arg(long)]
    pub same_host: bool,
    /// 解析脚本中的接口地址
    #[arg(long = "js")]
    pub js_parse: bool,
    #[command(flatten)]
    pub output: OutputArgs,
}

impl Commands {
    pub fn output(&self) -> &OutputArgs {
        match self {
            Commands::Subdomain(args) => &args.output,
            Commands::Resolve(args) => &args.output,
            Commands::Portscan(args) => &args.output,
            Commands::Probe(args) => &args.output,
            Commands::Crawl(args) => &args.output,
        }
    }
}

fn resolver_list(resolvers: &[String]) -> Vec<String> {
    let list: Vec<String> = resolvers
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if list.is_empty() {
        DEFAULT_RESOLVERS.iter().map(|s| s.to_string()).collect()
    } else {
        list
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

impl SubdomainConfig {
    pub fn from_cli(args: SubdomainArgs) -> Result<Self> {
        if args.bruteforce && args.wordlist.is_none() {
            anyhow::bail!("字典爆破需要通过 -w 指定字典文件");
        }
        if args.no_passive && !args.bruteforce {
            anyhow::bail!("已关闭被动枚举且未开启字典爆破，没有可执行的枚举方式");
        }

        let resolver = ResolverConfig {
            resolvers: resolver_list(&args.resolvers),
            workers: args.concurrency,
            ..ResolverConfig::default()
        };
        Ok(SubdomainConfig {
            domain: args.domain,
            wordlist: args.wordlist,
            workers: args.concurrency,
            timeout: Duration::from_secs(args.timeout),
            deadline: minutes(args.deadline),
            passive: !args.no_passive,
            bruteforce: args.bruteforce,
            resolver,
        })
    }
}

impl ResolverConfig {
    pub fn from_cli(args: &ResolveArgs) -> Result<Self> {
        Ok(ResolverConfig {
            resolvers: resolver_list(&args.resolvers),
            timeout: Duration::from_secs(args.timeout),
            retries: args.retries,
            workers: args.concurrency,
            ..ResolverConfig::default()
        })
    }
}

impl ResolveArgs {
    /// 待解析的名称，统一小写并去掉末尾的点。
    pub fn names(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let names = load_targets(&self.list)
            .context("读取待解析列表失败")?
            .into_iter()
            .map(|name| name.trim().trim_end_matches('.').to_lowercase())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect();
        Ok(names)
    }
}

impl PortScanConfig {
    pub fn from_cli(args: PortscanArgs) -> Result<Self> {
        let raw_targets = load_targets(&args.target).context("读取扫描目标失败")?;
        let targets = expand_hosts(&raw_targets);
        if targets.is_empty() {
            anyhow::bail!("没有有效的扫描目标");
        }

        let mut ports = parse_ports(&args.ports)?;
        if let Some(exclude_str) = args.exclude_ports {
            let exclude_set: HashSet<u16> = parse_ports(&exclude_str)?.into_iter().collect();
            ports.retain(|p| !exclude_set.contains(p));
        }
        if ports.is_empty() {
            anyhow::bail!("排除后没有可扫描的端口");
        }

        Ok(PortScanConfig {
            targets,
            ports,
            workers: args.concurrency,
            timeout: Duration::from_secs(args.timeout),
            rate_limit: args.rate,
            service_detect: args.service_detect || args.deep,
            deep: args.deep,
            deadline: minutes(args.deadline),
        })
    }
}

impl ProbeConfig {
    pub fn from_cli(args: ProbeArgs) -> Result<Self> {
        let targets = load_targets(&args.list).context("读取探测目标失败")?;
        let headers = args
            .headers
            .iter()
            .map(|h| parse_header(h))
            .collect::<Result<Vec<_>>>()?;

        Ok(ProbeConfig {
            targets,
            workers: args.concurrency,
            timeout: Duration::from_secs(args.timeout),
            follow_redirects: !args.no_follow,
            max_redirects: args.max_redirects,
            tls_verify: args.tls_verify,
            retries: args.retries,
            rate_limit: args.rate,
            adaptive: args.adaptive,
            headers,
            analyze: args.analyze,
            ..ProbeConfig::default()
        })
    }
}

impl CrawlConfig {
    pub fn from_cli(args: CrawlArgs) -> Result<Self> {
        let start_urls = load_targets(&args.url).context("读取起始地址失败")?;
        Ok(CrawlConfig {
            start_urls,
            max_depth: args.depth,
            max_urls: args.max_urls,
            workers: args.concurrency,
            timeout: Duration::from_secs(args.timeout),
            rate_limit: args.rate,
            host_rate_limit: args.host_rate,
            same_host: args.same_host,
            js_parse: args.js_parse,
            ..CrawlConfig::default()
        })
    }
}

/// 'Name: Value'
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("无效的请求头格式: {} (应为 'Name: Value')", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("请求头名称为空: {}", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// 解析 "80,443,8000-8100" 形式的端口列表，去重并升序。
pub fn parse_ports(port_str: &str) -> Result<Vec<u16>> {
    let mut ports = HashSet::new();
    for part in port_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.contains('-') {
            let range: Vec<&str> = part.split('-').collect();
            if range.len() != 2 {
                anyhow::bail!("无效的端口范围格式: {}", part);
            }
            let start: u16 = range[0].trim().parse().context("解析端口范围起始值失败")?;
            let end: u16 = range[1].trim().parse().context("解析端口范围结束值失败")?;
            if start > end {
                anyhow::bail!("无效的端口范围: {}-{} (起始端口不能大于结束端口)", start, end);
            }
            if start == 0 {
                anyhow::bail!("端口必须在 1-65535 之间: {}", part);
            }
            ports.extend(start..=end);
        } else {
            let p: u16 = part.parse().with_context(|| format!("解析端口失败: {}", part))?;
            if p == 0 {
                anyhow::bail!("端口必须在 1-65535 之间: {}", part);
            }
            ports.insert(p);
        }
    }
    if ports.is_empty() {
        anyhow::bail!("端口列表为空");
    }
    let mut sorted_ports: Vec<u16> = ports.into_iter().collect();
    sorted_ports.sort_unstable();
    Ok(sorted_ports)
}
