//! Corefile-style configuration
//!
//! ```text
//! .:1053 {
//!     log
//!     block refuse "\.ads\.example\.$"
//!     forward . 9.9.9.9 1.1.1.1 {
//!         policy parallel
//!     }
//! }
//! ```

use crate::plugin::{create_plugin, Pipeline};
use anyhow::{Context, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<PluginConfig>,
}

pub struct Config {
    pub zones: Vec<ZoneConfig>,
}

pub struct ZoneConfig {
    pub name: String,
    pub pipeline: Pipeline,
}

impl ZoneConfig {
    /// Port from a `zone:port` name, 53 when absent or unparsable.
    pub fn port(&self) -> u16 {
        self.name.rsplit_once(':').and_then(|(_, p)| p.parse().ok()).unwrap_or(53)
    }
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

#[derive(Debug)]
struct RawZone { name: String, plugins: Vec<PluginConfig> }

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        Self::parse(&content)
    }

    /// Build one pipeline per zone. Plugins that fail to build are logged
    /// and left out of the pipeline.
    pub fn parse(content: &str) -> Result<Self> {
        let raw_zones = parse_tokens(&lex(content))?;
        let mut zones = Vec::with_capacity(raw_zones.len());

        for raw in raw_zones {
            let mut plugins = Vec::new();
            for p_cfg in &raw.plugins {
                match create_plugin(p_cfg) {
                    Ok(plugin) => plugins.push(plugin),
                    Err(e) => tracing::error!("[config] zone {}: skipping plugin '{}': {:#}", raw.name, p_cfg.name, e),
                }
            }
            zones.push(ZoneConfig { name: raw.name, pipeline: Pipeline::new(plugins) });
        }
        Ok(Config { zones })
    }
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '\n' => { tokens.push(Token::Newline); chars.next(); }
            '#' => { while chars.next_if(|&c| c != '\n').is_some() {} }
            '{' => { tokens.push(Token::OpenBrace); chars.next(); }
            '}' => { tokens.push(Token::CloseBrace); chars.next(); }
            '"' => {
                chars.next();
                let mut s = String::new();
                for c in chars.by_ref() {
                    if c == '"' { break; }
                    s.push(c);
                }
                tokens.push(Token::Text(s));
            }
            c if c.is_whitespace() => { chars.next(); }
            _ => {
                let mut s = String::new();
                while let Some(c) = chars.next_if(|&c| !(c.is_whitespace() || matches!(c, '#' | '{' | '}' | '"'))) {
                    s.push(c);
                }
                tokens.push(Token::Text(s));
            }
        }
    }
    tokens
}

fn parse_tokens(tokens: &[Token]) -> Result<Vec<RawZone>> {
    let mut i = 0;
    let mut zones = Vec::new();
    let mut zone_names = Vec::new();
    while i < tokens.len() {
        match &tokens[i] {
            Token::Text(s) => { zone_names.push(s.clone()); i += 1; }
            Token::OpenBrace => {
                if zone_names.is_empty() { anyhow::bail!("block without a zone name"); }
                let (plugins, next_i) = parse_block(tokens, i + 1)?;
                i = next_i;
                for name in zone_names.drain(..) { zones.push(RawZone { name, plugins: plugins.clone() }); }
            }
            Token::Newline => { i += 1; zone_names.clear(); }
            Token::CloseBrace => anyhow::bail!("unexpected '}}'"),
        }
    }
    Ok(zones)
}

/// Parse plugin directives up to the matching close brace.
fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<PluginConfig>, usize)> {
    let mut plugins = Vec::new();
    while i < tokens.len() {
        match &tokens[i] {
            Token::Newline => { i += 1; }
            Token::CloseBrace => return Ok((plugins, i + 1)),
            Token::OpenBrace => anyhow::bail!("block without a directive name"),
            Token::Text(name) => {
                let mut cfg = PluginConfig { name: name.clone(), args: Vec::new(), block: Vec::new() };
                i += 1;
                while let Some(Token::Text(arg)) = tokens.get(i) {
                    cfg.args.push(arg.clone());
                    i += 1;
                }
                if let Some(Token::OpenBrace) = tokens.get(i) {
                    let (sub_block, next_i) = parse_block(tokens, i + 1)?;
                    cfg.block = sub_block;
                    i = next_i;
                }
                plugins.push(cfg);
            }
        }
    }
    anyhow::bail!("unterminated block")
}
