use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::settings::Settings;

/// A compiled rewrite rule; applied in order, first match wins.
#[derive(Debug, Clone)]
struct CompiledRewrite {
    pattern: Regex,
    replacement: String,
}

/// Resolves request paths against the originals tree and computes cache
/// locations. The returned absolute paths never escape their roots; callers
/// must not concatenate further user input onto them.
#[derive(Debug)]
pub struct PathResolver {
    base_dir: PathBuf,
    cache_dir: PathBuf,
    rewrites: Vec<CompiledRewrite>,
}

impl PathResolver {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut rewrites = Vec::with_capacity(settings.rewrites.len());
        for (index, rule) in settings.rewrites.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                bail!("rewrite rule {index} has empty pattern");
            }
            let pattern = Regex::new(&rule.pattern)
                .with_context(|| format!("compile rewrite rule {index}"))?;
            rewrites.push(CompiledRewrite {
                pattern,
                replacement: rule.replacement.clone(),
            });
        }
        Ok(Self {
            base_dir: PathBuf::from(&settings.storage.base_dir),
            cache_dir: PathBuf::from(&settings.storage.cache_dir),
            rewrites,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolves a request-relative path to its cleaned form and the absolute
    /// location under `base_dir`. Rejects empty targets and traversal.
    pub fn resolve(&self, relative: &str) -> Result<(String, PathBuf)> {
        let prepared = relative.trim_start_matches('/');
        let prepared = self.apply_rewrites(prepared);
        let clean = lexical_clean(&prepared);
        if clean == "." {
            bail!("empty target path");
        }
        if clean == ".." || clean.starts_with("../") {
            bail!("path attempts to escape base directory");
        }
        let full = self.base_dir.join(&clean);
        Ok((clean, full))
    }

    /// Computes the cache file location for a geometry and cleaned relative
    /// path: `cache_dir/<geometry-prefix>/<relative>`.
    pub fn cache_path(&self, width: u32, height: u32, relative: &str) -> PathBuf {
        let prefix = geometry_prefix(width, height);
        let clean = lexical_clean(relative.trim_start_matches('/'));
        self.cache_dir.join(prefix).join(clean)
    }

    fn apply_rewrites(&self, input: &str) -> String {
        for rule in &self.rewrites {
            if rule.pattern.is_match(input) {
                return rule
                    .pattern
                    .replace_all(input, rule.replacement.as_str())
                    .into_owned();
            }
        }
        input.to_string()
    }
}

/// Formats the first cache path component: `<w>x<h>` with an empty side for
/// zero, `0x0` only when both are zero.
pub fn geometry_prefix(width: u32, height: u32) -> String {
    if width == 0 && height == 0 {
        return "0x0".to_string();
    }
    let w = if width > 0 {
        width.to_string()
    } else {
        String::new()
    };
    let h = if height > 0 {
        height.to_string()
    } else {
        String::new()
    };
    format!("{w}x{h}")
}

/// Lexically collapses `.` and `..` components of a slash-separated relative
/// path, keeping unmatched `..` at the front. Returns `.` for an empty
/// result, mirroring filesystem path cleaning.
fn lexical_clean(input: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut leading_parents = 0usize;
    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if kept.pop().is_none() {
                    leading_parents += 1;
                }
            }
            other => kept.push(other),
        }
    }
    let mut parts: Vec<&str> = Vec::with_capacity(leading_parents + kept.len());
    for _ in 0..leading_parents {
        parts.push("..");
    }
    parts.extend(kept);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
