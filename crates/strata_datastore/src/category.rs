//! File categories: bidirectional translation between flat working-directory
//! names and hierarchical datastore paths.
//!
//! A category is a working-directory regex plus a datastore template whose
//! `$N` tokens reference the regex's capturing groups. The datastore regex is
//! derived from the two: the first `$N` becomes a capturing group carrying the
//! body of working-directory group N, and every later `$N` becomes a
//! backreference to it.
//!
//! The `regex` crate has no backreferences, so the compiled datastore matcher
//! gives each repeated occurrence its own named group and requires its text
//! to equal the first occurrence after matching.

use crate::error::{DatastoreError, Result};
use crate::regex_groups::{self, CaptureGroup, SkeletonPiece, TemplateToken};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Datastore-side regex derived from a working-directory regex and a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPattern {
    /// Regex text with `\N` backreferences for repeated substitutions.
    pub regex: String,
    /// Equivalent source for the `regex` crate: first occurrences are named
    /// `g<N>`, repeats are named `r<N>_<k>`.
    pub matcher_source: String,
    /// Working-directory group number to datastore group number.
    pub group_remap: BTreeMap<usize, usize>,
}

/// Derive the datastore pattern for `template` given the working-directory
/// capture groups of `working_dir_regex`.
pub fn derive_datastore_pattern(
    working_dir_regex: &str,
    groups: &[CaptureGroup],
    template: &[TemplateToken],
) -> std::result::Result<DerivedPattern, String> {
    let mut regex = String::new();
    let mut matcher_source = String::new();
    let mut group_remap: BTreeMap<usize, usize> = BTreeMap::new();
    let mut repeat_counts: BTreeMap<usize, usize> = BTreeMap::new();
    let mut next_group = 1;

    for token in template {
        match token {
            TemplateToken::Literal(text) => {
                regex.push_str(text);
                matcher_source.push_str(text);
                next_group += regex_groups::count_groups(text)?;
            }
            TemplateToken::Group(n) => {
                let group = groups
                    .get(n.wrapping_sub(1))
                    .ok_or_else(|| format!("substitution ${} has no matching group", n))?;
                let body = group.body(working_dir_regex);
                match group_remap.get(n) {
                    Some(existing) => {
                        regex.push_str(&format!("\\{}", existing));
                        let k = repeat_counts.entry(*n).or_insert(0);
                        *k += 1;
                        matcher_source.push_str(&format!(
                            "(?P<r{}_{}>{})",
                            n,
                            k,
                            regex_groups::strip_group_names(body)
                        ));
                    }
                    None => {
                        group_remap.insert(*n, next_group);
                        regex.push_str(&format!("({})", body));
                        matcher_source.push_str(&format!(
                            "(?P<g{}>{})",
                            n,
                            regex_groups::strip_group_names(body)
                        ));
                        next_group += 1 + regex_groups::count_groups(body)?;
                    }
                }
            }
        }
    }

    Ok(DerivedPattern {
        regex,
        matcher_source,
        group_remap,
    })
}

/// Compiled datastore-side matcher that enforces repeated substitutions.
#[derive(Debug, Clone)]
pub struct DatastoreMatcher {
    regex: Regex,
    repeats: Vec<(String, String)>,
}

impl DatastoreMatcher {
    fn compile(source: &str) -> Result<Self> {
        let regex = compile_anchored(source)?;
        let repeats = regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                let rest = name.strip_prefix('r')?;
                let (n, _) = rest.split_once('_')?;
                Some((name.to_string(), format!("g{}", n)))
            })
            .collect();
        Ok(Self { regex, repeats })
    }

    /// Full-string match with repeated substitutions required to agree.
    pub fn captures<'h>(&self, haystack: &'h str) -> Option<Captures<'h>> {
        let caps = self.regex.captures(haystack)?;
        let consistent = self.repeats.iter().all(|(repeat, first)| {
            match (caps.name(repeat), caps.name(first)) {
                (Some(r), Some(f)) => r.as_str() == f.as_str(),
                (None, None) => true,
                _ => false,
            }
        });
        consistent.then_some(caps)
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.captures(haystack).is_some()
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

fn compile_anchored(source: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", source)).map_err(|e| DatastoreError::Pattern {
        pattern: source.to_string(),
        source: e,
    })
}

/// A validated file category.
#[derive(Debug, Clone)]
pub struct FileCategory {
    name: String,
    working_dir_regex: String,
    datastore_template: String,
    working_dir_pattern: Regex,
    template: Vec<TemplateToken>,
    skeleton: Vec<SkeletonPiece>,
    derived: DerivedPattern,
    datastore_matcher: DatastoreMatcher,
}

impl FileCategory {
    /// Build and validate a category. Any violation is a configuration error.
    pub fn new(
        name: impl Into<String>,
        working_dir_regex: impl Into<String>,
        datastore_template: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let working_dir_regex = working_dir_regex.into();
        let datastore_template = datastore_template.into();

        let working_dir_pattern = compile_anchored(&working_dir_regex)?;
        let groups = regex_groups::capture_groups(&working_dir_regex)
            .map_err(|message| DatastoreError::config(&name, message))?;
        if groups.len() + 1 != working_dir_pattern.captures_len() {
            return Err(DatastoreError::config(
                &name,
                format!(
                    "unable to locate the {} capturing groups of {}",
                    working_dir_pattern.captures_len() - 1,
                    working_dir_regex
                ),
            ));
        }

        let template = regex_groups::template_tokens(&datastore_template);
        validate_substitutions(&name, groups.len(), &template)?;

        let derived = derive_datastore_pattern(&working_dir_regex, &groups, &template)
            .map_err(|message| DatastoreError::config(&name, message))?;
        let datastore_matcher = DatastoreMatcher::compile(&derived.matcher_source)?;
        let skeleton = regex_groups::skeleton(&working_dir_regex, &groups);

        Ok(Self {
            name,
            working_dir_regex,
            datastore_template,
            working_dir_pattern,
            template,
            skeleton,
            derived,
            datastore_matcher,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir_regex(&self) -> &str {
        &self.working_dir_regex
    }

    pub fn datastore_template(&self) -> &str {
        &self.datastore_template
    }

    /// Derived datastore regex, with `\N` backreferences for repeats.
    pub fn datastore_regex(&self) -> &str {
        &self.derived.regex
    }

    /// Working-directory group number to datastore group number.
    pub fn group_remap(&self) -> &BTreeMap<usize, usize> {
        &self.derived.group_remap
    }

    pub fn working_dir_pattern(&self) -> &Regex {
        &self.working_dir_pattern
    }

    pub fn datastore_matcher(&self) -> &DatastoreMatcher {
        &self.datastore_matcher
    }

    pub fn matches_working_dir_name(&self, name: &str) -> bool {
        self.working_dir_pattern.is_match(name)
    }

    pub fn matches_datastore_name(&self, name: &str) -> bool {
        self.datastore_matcher.is_match(name)
    }

    /// Translate a working-directory name into its datastore path.
    pub fn to_datastore_name(&self, working_dir_name: &str) -> Option<String> {
        let caps = self.working_dir_pattern.captures(working_dir_name)?;
        let mut out = String::with_capacity(working_dir_name.len() + 16);
        for token in &self.template {
            match token {
                TemplateToken::Literal(text) => {
                    out.push_str(&regex_groups::template_literal_text(text))
                }
                TemplateToken::Group(n) => {
                    out.push_str(caps.get(*n).map_or("", |m| m.as_str()));
                }
            }
        }
        Some(out)
    }

    /// Translate a datastore path back into its working-directory name.
    pub fn to_working_dir_name(&self, datastore_name: &str) -> Option<String> {
        let caps = self.datastore_matcher.captures(datastore_name)?;
        let mut out = String::with_capacity(datastore_name.len());
        for piece in &self.skeleton {
            match piece {
                SkeletonPiece::Literal(text) => out.push_str(text),
                SkeletonPiece::Group(n) => {
                    let value = caps.name(&format!("g{}", n)).map_or("", |m| m.as_str());
                    out.push_str(value);
                }
            }
        }
        Some(out)
    }

    /// Number of `/`-separated levels in the datastore regex.
    pub fn datastore_levels(&self) -> usize {
        regex_groups::split_path_segments(&self.derived.matcher_source).len()
    }

    /// Matcher for the first `level` directory levels of the datastore path.
    pub fn datastore_pattern_truncated_to_level(&self, level: usize) -> Result<DatastoreMatcher> {
        let segments = regex_groups::split_path_segments(&self.derived.matcher_source);
        if level < 1 || level > segments.len() {
            return Err(DatastoreError::Truncation {
                regex: self.derived.regex.clone(),
                level: level as i64,
            });
        }
        DatastoreMatcher::compile(&segments[..level].join("/"))
    }

    /// Matcher for the datastore path with its lowest `levels` levels removed.
    pub fn datastore_pattern_with_low_levels_truncated(
        &self,
        levels: usize,
    ) -> Result<DatastoreMatcher> {
        let total = self.datastore_levels();
        if levels > total {
            return Err(DatastoreError::Truncation {
                regex: self.derived.regex.clone(),
                level: total as i64 - levels as i64,
            });
        }
        self.datastore_pattern_truncated_to_level(total - levels)
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} <-> {}",
            self.name, self.working_dir_regex, self.derived.regex
        )
    }
}

/// Distinct substitution indices must be exactly `1..=k` and `k` must equal
/// the number of working-directory groups.
fn validate_substitutions(name: &str, group_count: usize, template: &[TemplateToken]) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DatastoreError::config(name, "No name specified"));
    }

    let substitutions: BTreeSet<usize> = template
        .iter()
        .filter_map(|token| match token {
            TemplateToken::Group(n) => Some(*n),
            TemplateToken::Literal(_) => None,
        })
        .collect();
    let contiguous = substitutions.iter().copied().eq(1..=substitutions.len());
    if !contiguous {
        return Err(DatastoreError::config(
            name,
            format!(
                "Datastore template does not contain contiguous substitutions from 1 to {}",
                substitutions.len()
            ),
        ));
    }
    if substitutions.len() != group_count {
        return Err(DatastoreError::config(
            name,
            format!(
                "Number of task dir groups, {} does not equal number of datastore substitutions, {}",
                group_count,
                substitutions.len()
            ),
        ));
    }
    Ok(())
}
