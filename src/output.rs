use crate::config::OutputArgs;
use crate::http::crawler::CrawlResult;
use crate::http::prober::ProbeResult;
use crate::scanner::portscan::PortResult;
use crate::scanner::resolver::ResolutionResult;
use crate::scanner::subdomain::SubdomainResult;
use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON 数组
    Json,
    /// 每行一个主字段
    Txt,
}

/// 纯文本模式下每条记录输出的一行。
pub trait TextRecord {
    fn text_line(&self) -> String;
}

impl TextRecord for SubdomainResult {
    fn text_line(&self) -> String {
        self.subdomain.clone()
    }
}

impl TextRecord for ResolutionResult {
    fn text_line(&self) -> String {
        self.subdomain.clone()
    }
}

impl TextRecord for PortResult {
    fn text_line(&self) -> String {
        let host_port = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        if self.service.is_empty() {
            host_port
        } else {
            format!("{} {}", host_port, self.service)
        }
    }
}

impl TextRecord for ProbeResult {
    fn text_line(&self) -> String {
        self.url.clone()
    }
}

impl TextRecord for CrawlResult {
    fn text_line(&self) -> String {
        self.url.clone()
    }
}

pub fn write_results<W, T>(writer: &mut W, results: &[T], format: OutputFormat) -> Result<()>
where
    W: Write,
    T: Serialize + TextRecord,
{
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, results).context("序列化 JSON 失败")?;
            writeln!(writer)?;
        }
        OutputFormat::Txt => {
            for record in results {
                writeln!(writer, "{}", record.text_line())?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// 写入 -o 指定的文件，未指定时写到标准输出。
pub fn output_results<T>(results: &[T], args: &OutputArgs) -> Result<()>
where
    T: Serialize + TextRecord,
{
    match &args.output {
        Some(path) => {
            save_to_file(results, path, args.format)?;
            eprintln!("{} {:?}", "结果已保存至:".green(), path);
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            write_results(&mut writer, results, args.format)?;
        }
    }
    Ok(())
}

fn save_to_file<T>(results: &[T], path: &Path, format: OutputFormat) -> Result<()>
where
    T: Serialize + TextRecord,
{
    let file = File::create(path).with_context(|| format!("无法创建输出文件: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    write_results(&mut writer, results, format)
}

pub fn print_summary(command: &str, found: usize, elapsed: Duration) {
    eprintln!("\n{}", "扫描摘要:".bold().underline());
    eprintln!("  任务: {}", command.cyan());
    eprintln!("  结果数: {}", found.to_string().green());
    eprintln!("  耗时: {}", format!("{:.2}s", elapsed.as_secs_f64()).yellow());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(host: &str, port: u16, service: &str) -> PortResult {
        PortResult {
            host: host.to_string(),
            port,
            open: true,
            service: service.to_string(),
            banner: String::new(),
            version: String::new(),
            product: String::new(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_text_lines() {
        assert_eq!(port("10.0.0.1", 22, "ssh").text_line(), "10.0.0.1:22 ssh");
        assert_eq!(port("10.0.0.1", 9999, "").text_line(), "10.0.0.1:9999");
        assert_eq!(port("::1", 80, "http").text_line(), "[::1]:80 http");

        let sub = SubdomainResult {
            subdomain: "www.example.com".to_string(),
            ips: vec![],
            source: "crtsh".to_string(),
            timestamp: String::new(),
        };
        assert_eq!(sub.text_line(), "www.example.com");
    }

    #[test]
    fn test_write_json_array() {
        let mut buf = Vec::new();
        write_results(&mut buf, &[port("h", 80, "http")], OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value[0]["host"], "h");
        assert_eq!(value[0]["port"], 80);
        assert_eq!(value[0]["open"], true);

        let mut empty = Vec::new();
        write_results::<_, PortResult>(&mut empty, &[], OutputFormat::Json).unwrap();
        assert_eq!(String::from_utf8(empty).unwrap().trim(), "[]");
    }

    #[test]
    fn test_save_txt_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let results = vec![port("a", 22, "ssh"), port("b", 80, "http")];
        save_to_file(&results, &path, OutputFormat::Txt).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a:22 ssh\nb:80 http\n");
    }
}
