//! Overlap bookkeeping for dependency staging.
//!
//! Every `import_files` call during staging reports which paths it
//! overwrote; the collector turns those reports into per-path chains of
//! writers and applies each overwriter's whitelist and its project's
//! fatal-warning policy.

use crate::{
    error::{BstError, Result},
    utils,
    vdir::FileListResult,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// The policy consulted for one overwriting element.
#[derive(Clone, Debug, Default)]
pub struct OverlapPolicy {
    whitelist: Vec<Regex>,
    /// Whether the element's project promotes overlap warnings to errors.
    pub fatal: bool,
}

impl OverlapPolicy {
    /// Compiles the element's whitelist globs.
    ///
    /// Patterns are anchored absolute: `*` stops at path separators, `**`
    /// crosses them, `?` matches one non-separator character and character
    /// classes pass through.
    pub fn new(whitelist_globs: &[String], fatal: bool) -> Result<Self> {
        let mut whitelist = Vec::with_capacity(whitelist_globs.len());
        for glob in whitelist_globs {
            let anchored =
                if glob.starts_with('/') { glob.clone() } else { format!("/{glob}") };
            let regex = Regex::new(&utils::glob_to_regex(&anchored)).map_err(|err| {
                BstError::load(format!("invalid overlap whitelist pattern {glob:?}: {err}"))
            })?;
            whitelist.push(regex);
        }
        Ok(Self { whitelist, fatal })
    }

    fn is_whitelisted(&self, path: &str) -> bool {
        let absolute = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        self.whitelist.iter().any(|re| re.is_match(&absolute))
    }
}

/// The non-fatal findings of an overlap resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlapOutcome {
    /// One line per non-whitelisted, non-fatal overlap: the full
    /// `[bottom, .., top]` chain for the path.
    pub warnings: Vec<String>,
    /// Files dropped because they would have replaced a non-empty
    /// directory, by staging element.
    pub ignored: BTreeMap<String, Vec<String>>,
}

/// Accumulates staging reports and resolves them into warnings or an error.
#[derive(Debug, Default)]
pub struct OverlapCollector {
    /// path -> chain of writers, staging order, bottom first.
    overlaps: BTreeMap<String, Vec<String>>,
    /// Which element wrote which paths, in staging order.
    files_written: Vec<(String, BTreeSet<String>)>,
    ignored: BTreeMap<String, Vec<String>>,
}

impl OverlapCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the staging result of one element.
    pub fn record(&mut self, element_name: &str, result: &FileListResult) {
        for overwrite in &result.overwritten {
            match self.overlaps.get_mut(overwrite) {
                Some(chain) => chain.push(element_name.to_string()),
                None => {
                    // Find the bottom writer: the first element which staged
                    // this path.
                    let bottom = self
                        .files_written
                        .iter()
                        .find(|(_, written)| written.contains(overwrite))
                        .map(|(name, _)| name.clone());
                    if let Some(bottom) = bottom {
                        self.overlaps.insert(
                            overwrite.clone(),
                            vec![bottom, element_name.to_string()],
                        );
                    }
                }
            }
        }
        self.files_written
            .push((element_name.to_string(), result.files_written.iter().cloned().collect()));
        if !result.ignored.is_empty() {
            self.ignored
                .entry(element_name.to_string())
                .or_default()
                .extend(result.ignored.iter().cloned());
        }
    }

    /// Whether any overlap was recorded at all.
    pub fn has_overlaps(&self) -> bool {
        !self.overlaps.is_empty()
    }

    /// Applies each overwriter's policy.
    ///
    /// A non-whitelisted overwrite is an error when the overwriter's
    /// project promotes overlaps, a warning otherwise; whitelisted
    /// overwrites pass silently. Any error aborts with reason
    /// `overlap-error` before commands run.
    pub fn resolve(&self, policies: &BTreeMap<String, OverlapPolicy>) -> Result<OverlapOutcome> {
        let mut warning_detail = String::new();
        let mut error_detail = String::new();
        let mut warnings = Vec::new();

        for (path, chain) in &self.overlaps {
            let mut error_elements = Vec::new();
            let mut warning_elements = Vec::new();
            // The bottom element overlaps nothing.
            for overwriter in &chain[1..] {
                let policy = policies.get(overwriter).cloned().unwrap_or_default();
                if policy.is_whitelisted(path) {
                    continue;
                }
                if policy.fatal {
                    error_elements.push(overwriter.clone());
                } else {
                    warning_elements.push(overwriter.clone());
                }
            }
            if !warning_elements.is_empty() {
                let line = format!("/{path}: {} overlap [{}]", warning_elements.join(", "), chain.join(", "));
                warning_detail.push_str(&line);
                warning_detail.push('\n');
                warnings.push(line);
            }
            if !error_elements.is_empty() {
                error_detail.push_str(&format!(
                    "/{path}: {} are not permitted to overlap other elements [{}]\n",
                    error_elements.join(", "),
                    chain.join(", ")
                ));
            }
        }

        if !error_detail.is_empty() {
            return Err(BstError::element("forbidden overlaps detected during staging")
                .with_reason("overlap-error")
                .with_detail(error_detail));
        }
        Ok(OverlapOutcome { warnings, ignored: self.ignored.clone() })
    }
}
