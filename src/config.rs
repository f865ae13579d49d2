//! Corefile parsing

use crate::dnsutil::normalize_zone;
use crate::plugin::{create_plugin, SharedState, Plugin};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_PORT: u16 = 53;

#[derive(Clone, Debug, Default)]
pub struct PluginConfig {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<PluginConfig>,
    /// Normalized zones of the enclosing server block.
    pub server_zones: Vec<String>,
}

pub struct Config {
    pub zones: Vec<ZoneConfig>,
}

/// One server block: `example.com:1053 other.org:1053 { ... }`.
pub struct ZoneConfig {
    pub name: String,
    pub zones: Vec<String>,
    pub port: u16,
    pub plugins: Vec<Box<dyn Plugin>>,
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

struct RawBlock { keys: Vec<String>, plugins: Vec<PluginConfig> }

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &str, shared: Arc<SharedState>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content, shared)
    }

    pub fn parse(content: &str, shared: Arc<SharedState>) -> Result<Self> {
        let tokens = Self::lex(content);
        let raw_blocks = Self::parse_tokens(&tokens)?;
        let mut zones = Vec::new();

        for raw in raw_blocks {
            let name = raw.keys.join(" ");
            let port = block_port(&raw.keys)?;
            let server_zones: Vec<String> = raw.keys.iter().map(|k| normalize_zone(k)).collect();

            let mut seen = HashSet::new();
            let mut plugins = Vec::new();
            for p_cfg in &raw.plugins {
                if !seen.insert(p_cfg.name.clone()) {
                    anyhow::bail!("plugin '{}' is declared more than once in server block '{}'", p_cfg.name, name);
                }
                let mut p_cfg = p_cfg.clone();
                p_cfg.server_zones = server_zones.clone();
                let plugin = create_plugin(&p_cfg, shared.clone())
                    .with_context(|| format!("server block '{}': plugin '{}'", name, p_cfg.name))?;
                plugins.push(plugin);
            }

            // execution order comes from plugin priority, not from the order in the Corefile
            plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));

            zones.push(ZoneConfig { name, zones: server_zones, port, plugins });
        }
        if zones.is_empty() { anyhow::bail!("no server blocks defined"); }
        Ok(Config { zones })
    }

    fn lex(input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '\n' { tokens.push(Token::Newline); chars.next(); }
            else if c.is_whitespace() { chars.next(); }
            else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } }
            else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); }
            else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); }
            else if c == '"' {
                chars.next();
                let mut s = String::new();
                while let Some(&c) = chars.peek() { if c == '"' { chars.next(); break; } s.push(c); chars.next(); }
                tokens.push(Token::Text(s));
            } else {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '#' || c == '{' || c == '}' || c == '"' { break; }
                    s.push(c); chars.next();
                }
                tokens.push(Token::Text(s));
            }
        }
        tokens
    }

    fn parse_tokens(tokens: &[Token]) -> Result<Vec<RawBlock>> {
        let mut i = 0;
        let mut blocks = Vec::new();
        let mut keys = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Text(s) => { keys.push(s.clone()); i += 1; }
                Token::OpenBrace => {
                    if keys.is_empty() { anyhow::bail!("server block without a zone key"); }
                    i += 1;
                    let (plugins, next_i) = Self::parse_block(tokens, i)?;
                    i = next_i;
                    blocks.push(RawBlock { keys: std::mem::take(&mut keys), plugins });
                }
                Token::Newline => { i += 1; keys.clear(); }
                Token::CloseBrace => anyhow::bail!("unexpected '}}' outside a server block"),
            }
        }
        Ok(blocks)
    }

    /// Parse a configuration block starting at position i
    fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<PluginConfig>, usize)> {
        let mut plugins = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Newline => { i += 1; }
                Token::CloseBrace => { i += 1; return Ok((plugins, i)); }
                Token::Text(name) => {
                    let plugin_name = name.clone(); i += 1;
                    let mut args = Vec::new();
                    let mut block = Vec::new();
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                            Token::OpenBrace => {
                                i += 1;
                                let (sub_block, next_i) = Self::parse_block(tokens, i)?;
                                block = sub_block; i = next_i; break;
                            }
                            Token::Newline | Token::CloseBrace => { break; }
                        }
                    }
                    plugins.push(PluginConfig { name: plugin_name, args, block, server_zones: Vec::new() });
                }
                Token::OpenBrace => anyhow::bail!("unexpected '{{' without a directive"),
            }
        }
        anyhow::bail!("unterminated block: missing '}}'")
    }
}

/// All keys of one server block must agree on the port.
fn block_port(keys: &[String]) -> Result<u16> {
    let mut port = None;
    for key in keys {
        let host = key.strip_prefix("dns://").unwrap_or(key);
        let p = match host.rfind(':') {
            Some(idx) => host[idx + 1..].parse::<u16>().with_context(|| format!("invalid port in server key '{}'", key))?,
            None => DEFAULT_PORT,
        };
        match port {
            Some(existing) if existing != p => anyhow::bail!("server block keys disagree on port: {} vs {}", existing, p),
            _ => port = Some(p),
        }
    }
    Ok(port.unwrap_or(DEFAULT_PORT))
}
