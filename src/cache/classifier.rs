//! Maps request URLs to the partition (and therefore strategy) that owns them.

use color_eyre::Result;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use url::Url;

use crate::config::CacheConfig;

const STATIC_EXTENSIONS: &[&str] = &["css", "js", "ico"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "gif", "webp"];

/// The four logical cache partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
  Static,
  Api,
  Image,
  Dynamic,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 4] = [
    PartitionKind::Static,
    PartitionKind::Api,
    PartitionKind::Image,
    PartitionKind::Dynamic,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      PartitionKind::Static => "static",
      PartitionKind::Api => "api",
      PartitionKind::Image => "image",
      PartitionKind::Dynamic => "dynamic",
    }
  }
}

impl fmt::Display for PartitionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Versioned partition names for the current worker.
#[derive(Debug, Clone)]
pub struct PartitionNames {
  prefix: String,
  version: String,
}

impl PartitionNames {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      prefix: config.prefix.clone(),
      version: config.version.clone(),
    }
  }

  pub fn name(&self, kind: PartitionKind) -> String {
    format!("{}-{}-{}", self.prefix, kind, self.version)
  }

  pub fn current(&self) -> Vec<String> {
    PartitionKind::ALL.iter().map(|k| self.name(*k)).collect()
  }

  /// A partition left behind by a previous version of this application.
  pub fn is_superseded(&self, name: &str) -> bool {
    name.starts_with(&format!("{}-", self.prefix)) && !self.current().iter().any(|c| c == name)
  }
}

/// A single predicate over request URLs.
#[derive(Debug)]
enum Rule {
  /// Exact listed paths or the `/assets/` tree on the app origin, or a
  /// static file extension on any origin
  StaticAsset { paths: Vec<String> },
  /// Any configured API regex matches the full URL
  Api { patterns: Vec<Regex> },
  /// Known image host prefix or an image file extension
  Image { hosts: Vec<String> },
}

impl Rule {
  fn matches(&self, url: &Url, origin: &Url) -> bool {
    match self {
      Rule::StaticAsset { paths } => {
        let path = url.path();
        if has_extension(path, STATIC_EXTENSIONS) {
          return true;
        }
        url.origin() == origin.origin()
          && (paths.iter().any(|p| p == path) || path.starts_with("/assets/"))
      }
      Rule::Api { patterns } => patterns.iter().any(|re| re.is_match(url.as_str())),
      Rule::Image { hosts } => {
        hosts.iter().any(|h| has_url_prefix(url.as_str(), h))
          || has_extension(url.path(), IMAGE_EXTENSIONS)
      }
    }
  }
}

/// `prefix` must end on a host or path segment boundary.
fn has_url_prefix(url: &str, prefix: &str) -> bool {
  match url.strip_prefix(prefix) {
    Some(rest) => {
      prefix.ends_with('/') || rest.is_empty() || rest.starts_with(['/', '?', '#', ':'])
    }
    None => false,
  }
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
  let file = path.rsplit('/').next().unwrap_or(path);
  match file.rsplit_once('.') {
    Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
    None => false,
  }
}

/// Ordered (rule, partition) table. The first matching rule wins; unmatched URLs are dynamic.
#[derive(Debug)]
pub struct Classifier {
  origin: Url,
  rules: Vec<(Rule, PartitionKind)>,
}

impl Classifier {
  pub fn new(config: &CacheConfig, origin: Url) -> Result<Self> {
    let rules = vec![
      (
        Rule::StaticAsset {
          paths: config.static_assets.clone(),
        },
        PartitionKind::Static,
      ),
      (
        Rule::Api {
          patterns: config.compiled_api_patterns()?,
        },
        PartitionKind::Api,
      ),
      (
        Rule::Image {
          hosts: config.image_hosts.clone(),
        },
        PartitionKind::Image,
      ),
    ];

    Ok(Self { origin, rules })
  }

  pub fn classify(&self, url: &Url) -> PartitionKind {
    self
      .rules
      .iter()
      .find(|(rule, _)| rule.matches(url, &self.origin))
      .map(|(_, kind)| *kind)
      .unwrap_or(PartitionKind::Dynamic)
  }
}
