//! Structured addresses into the document store.
//!
//! Canonical forms:
//! - `<repo>/-/<filename>/@<release>[/<type>[/<sub path>]][#<fragment>]`
//! - `<repo>/-/<filename>/+<intent>[/<type>[/<sub path>]][#<fragment>]`
//! - `-/<filename>/...` for global refs (empty repo)
//! - `@<release>/...` or `+<intent>/...` for refs relative to their package
//!
//! A bare `@` names the mutable "latest release" pointer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Segment separating the repo from the filename.
const HEAD_SEPARATOR: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRefError {
    #[error("empty ref")]
    Empty,
    #[error("ref '{0}' has an empty path segment")]
    EmptySegment(String),
    #[error("ref '{0}' has no filename before its release")]
    MissingFilename(String),
    #[error("ref '{0}' has no '@' or '+' release segment")]
    MissingRelease(String),
    #[error("ref '{0}' has unknown sub path type '{1}'")]
    UnknownSubPathType(String, String),
    #[error("ref '{0}' has an empty fragment after '#'")]
    EmptyFragment(String),
}

/// Release selector of a ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReleaseOrIntent {
    /// `@<value>`; an empty value is the latest-release pointer.
    Release(String),
    /// `+<value>`.
    Intent(String),
}

impl ReleaseOrIntent {
    pub fn latest() -> Self {
        Self::Release(String::new())
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Release(value) | Self::Intent(value) => value,
        }
    }

    pub fn is_intent(&self) -> bool {
        matches!(self, Self::Intent(_))
    }
}

impl fmt::Display for ReleaseOrIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release(value) => write!(f, "@{}", value),
            Self::Intent(value) => write!(f, "+{}", value),
        }
    }
}

/// Kind of resource addressed below a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubPathType {
    None,
    Deploy,
    Task,
    Custom,
    Environment,
    Commit,
    Op,
}

impl SubPathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Deploy => "deploy",
            Self::Task => "task",
            Self::Custom => "custom",
            Self::Environment => "environment",
            Self::Commit => "commit",
            Self::Op => "op",
        }
    }
}

impl FromStr for SubPathType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(Self::Deploy),
            "task" => Ok(Self::Task),
            "custom" => Ok(Self::Custom),
            "environment" => Ok(Self::Environment),
            "commit" => Ok(Self::Commit),
            "op" => Ok(Self::Op),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SubPathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a document (or a JSON fragment inside one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    /// Source repository (e.g. "github.com/acme/app"); empty for global refs
    pub repo: String,
    /// Package file within the repo; empty for relative refs
    pub filename: String,
    pub release: ReleaseOrIntent,
    pub sub_path_type: SubPathType,
    /// Rendered only when `sub_path_type` is not `None`
    pub sub_path: String,
    /// `/`-separated key path into the stored JSON body
    pub fragment: String,
}

impl Ref {
    /// The latest-release ref of a package.
    pub fn package(repo: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            filename: filename.into(),
            release: ReleaseOrIntent::latest(),
            sub_path_type: SubPathType::None,
            sub_path: String::new(),
            fragment: String::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseRefError> {
        s.parse()
    }

    pub fn with_release(mut self, release: ReleaseOrIntent) -> Self {
        self.release = release;
        self
    }

    pub fn with_sub_path(mut self, sub_path_type: SubPathType, sub_path: impl Into<String>) -> Self {
        self.sub_path_type = sub_path_type;
        self.sub_path = sub_path.into();
        self
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = fragment.into();
        self
    }

    pub fn set_sub_path(&mut self, sub_path: impl Into<String>) {
        self.sub_path = sub_path.into();
    }

    pub fn set_sub_path_type(&mut self, sub_path_type: SubPathType) {
        self.sub_path_type = sub_path_type;
    }

    pub fn set_fragment(&mut self, fragment: impl Into<String>) {
        self.fragment = fragment.into();
    }

    pub fn set_release(&mut self, release: ReleaseOrIntent) {
        self.release = release;
    }

    /// Replace the release/intent value, keeping its discriminant.
    pub fn set_version(&mut self, version: impl Into<String>) {
        let version = version.into();
        self.release = match self.release {
            ReleaseOrIntent::Release(_) => ReleaseOrIntent::Release(version),
            ReleaseOrIntent::Intent(_) => ReleaseOrIntent::Intent(version),
        };
    }

    /// Same path, addressed in the intent tree (`+`).
    pub fn make_intent(&self) -> Self {
        let mut out = self.clone();
        out.release = ReleaseOrIntent::Intent(String::new());
        out
    }

    /// Same path, addressed at release `version` (empty = latest).
    pub fn make_release(&self, version: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.release = ReleaseOrIntent::Release(version.into());
        out
    }

    /// Append `segment` to the sub path.
    pub fn join_sub_path(&self, segment: &str) -> Self {
        let mut out = self.clone();
        if out.sub_path.is_empty() {
            out.sub_path = segment.to_string();
        } else {
            out.sub_path = format!("{}/{}", out.sub_path, segment);
        }
        out
    }

    pub fn is_relative(&self) -> bool {
        self.filename.is_empty()
    }

    pub fn is_latest(&self) -> bool {
        self.release == ReleaseOrIntent::latest()
    }

    pub fn is_intent(&self) -> bool {
        self.release.is_intent()
    }

    /// Resolve a package-relative ref against `base`. Absolute refs are returned unchanged.
    pub fn relative_to(&self, base: &Ref) -> Self {
        if !self.is_relative() {
            return self.clone();
        }
        let mut out = self.clone();
        out.repo = base.repo.clone();
        out.filename = base.filename.clone();
        out
    }

    /// Latest-release ref of the package this ref belongs to.
    pub fn package_ref(&self) -> Self {
        Self::package(self.repo.clone(), self.filename.clone())
    }

    /// This ref's release (or intent) root, without sub path or fragment.
    pub fn release_ref(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            filename: self.filename.clone(),
            release: self.release.clone(),
            sub_path_type: SubPathType::None,
            sub_path: String::new(),
            fragment: String::new(),
        }
    }

    pub fn without_fragment(&self) -> Self {
        let mut out = self.clone();
        out.fragment.clear();
        out
    }

    /// Drop the last sub path segment, then the sub path type.
    pub fn parent(&self) -> Option<Self> {
        let mut out = self.without_fragment();
        if let Some((head, _)) = self.sub_path.rsplit_once('/') {
            out.sub_path = head.to_string();
            return Some(out);
        }
        if !self.sub_path.is_empty() {
            out.sub_path.clear();
            return Some(out);
        }
        if self.sub_path_type != SubPathType::None {
            out.sub_path_type = SubPathType::None;
            return Some(out);
        }
        None
    }

    /// Last segment of the sub path, if any.
    pub fn name(&self) -> Option<&str> {
        if self.sub_path.is_empty() {
            return None;
        }
        self.sub_path.rsplit('/').next()
    }

    /// Rendered ref without the fragment; the form used for storage keys.
    pub fn path(&self) -> String {
        self.without_fragment().to_string()
    }

    /// Storage directory of this ref: `refs/<path>`.
    pub fn storage_path(&self) -> String {
        format!("refs/{}", self.path())
    }

    /// `<repo>/-/<filename>` (or `-/<filename>` for global refs); the leading part
    /// shared by every ref of this package.
    pub fn package_prefix(&self) -> String {
        if self.repo.is_empty() {
            format!("{}/{}", HEAD_SEPARATOR, self.filename)
        } else {
            format!("{}/{}/{}", self.repo, HEAD_SEPARATOR, self.filename)
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.filename.is_empty() {
            if !self.repo.is_empty() {
                write!(f, "{}/", self.repo)?;
            }
            write!(f, "{}/{}/", HEAD_SEPARATOR, self.filename)?;
        }
        write!(f, "{}", self.release)?;
        if self.sub_path_type != SubPathType::None {
            write!(f, "/{}", self.sub_path_type)?;
            if !self.sub_path.is_empty() {
                write!(f, "/{}", self.sub_path)?;
            }
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

impl FromStr for Ref {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseRefError::Empty);
        }
        let (body, fragment) = match s.split_once('#') {
            Some((_, "")) => return Err(ParseRefError::EmptyFragment(s.to_string())),
            Some((body, fragment)) => (body, fragment),
            None => (s, ""),
        };
        let segments: Vec<&str> = body.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(ParseRefError::EmptySegment(s.to_string()));
        }

        let is_release = |segment: &&str| segment.starts_with('@') || segment.starts_with('+');
        let (repo, filename, rest) = match segments.iter().position(|seg| *seg == HEAD_SEPARATOR) {
            Some(head) => {
                let after = &segments[head + 1..];
                let release_at = after
                    .iter()
                    .position(is_release)
                    .ok_or_else(|| ParseRefError::MissingRelease(s.to_string()))?;
                if release_at == 0 {
                    return Err(ParseRefError::MissingFilename(s.to_string()));
                }
                (
                    segments[..head].join("/"),
                    after[..release_at].join("/"),
                    &after[release_at..],
                )
            }
            None => {
                if !is_release(&segments[0]) {
                    return Err(ParseRefError::MissingRelease(s.to_string()));
                }
                (String::new(), String::new(), &segments[..])
            }
        };

        let release = match rest[0].split_at(1) {
            ("@", value) => ReleaseOrIntent::Release(value.to_string()),
            (_, value) => ReleaseOrIntent::Intent(value.to_string()),
        };
        let (sub_path_type, sub_path) = match rest.get(1) {
            Some(kind) => {
                let parsed = kind.parse::<SubPathType>().map_err(|_| {
                    ParseRefError::UnknownSubPathType(s.to_string(), kind.to_string())
                })?;
                (parsed, rest[2..].join("/"))
            }
            None => (SubPathType::None, String::new()),
        };

        Ok(Self {
            repo,
            filename,
            release,
            sub_path_type,
            sub_path,
            fragment: fragment.to_string(),
        })
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms_round_trip() {
        let inputs = [
            "github.com/acme/app/-/deploy.star/@",
            "github.com/acme/app/-/deploy.star/@abc123",
            "repo/-/pkg/+",
            "repo/-/pkg/+/custom/x",
            "repo/-/pkg/+/custom/nested/key",
            "repo/-/dir/pkg.star/@v1.2/deploy/staging/3",
            "repo/-/pkg/@abc/deploy/staging#outputs/url",
            "repo/-/pkg/@abc/task",
            "-/global.star/@/environment/prod",
            "@/deploy/staging",
            "+/custom/region",
            "+named/op/check_envs",
            "repo/-/pkg/@abc/commit/0123abcd",
        ];
        for input in inputs {
            let parsed = Ref::parse(input).expect("parse should succeed");
            assert_eq!(parsed.to_string(), input);
        }

        let unfragmented = Ref::parse("repo/-/pkg/@r#x")
            .expect("parse should succeed")
            .without_fragment();
        assert_eq!(unfragmented.to_string(), "repo/-/pkg/@r");
        assert!(Ref::parse(&unfragmented.to_string()).is_ok());
    }

    #[test]
    fn parses_components() {
        let r = Ref::parse("github.com/acme/app/-/ci/pkg.star/@rel/deploy/staging/2#outputs/url")
            .expect("parse should succeed");
        assert_eq!(r.repo, "github.com/acme/app");
        assert_eq!(r.filename, "ci/pkg.star");
        assert_eq!(r.release, ReleaseOrIntent::Release("rel".to_string()));
        assert_eq!(r.sub_path_type, SubPathType::Deploy);
        assert_eq!(r.sub_path, "staging/2");
        assert_eq!(r.fragment, "outputs/url");
        assert_eq!(r.name(), Some("2"));
    }

    #[test]
    fn rejects_malformed_refs() {
        assert_eq!(Ref::parse(""), Err(ParseRefError::Empty));
        assert!(matches!(
            Ref::parse("repo/-/pkg"),
            Err(ParseRefError::MissingRelease(_))
        ));
        assert!(matches!(
            Ref::parse("repo/-/@abc"),
            Err(ParseRefError::MissingFilename(_))
        ));
        assert!(matches!(
            Ref::parse("repo//-/pkg/@"),
            Err(ParseRefError::EmptySegment(_))
        ));
        assert!(matches!(
            Ref::parse("repo/-/pkg/@/bogus/x"),
            Err(ParseRefError::UnknownSubPathType(_, _))
        ));
        assert!(matches!(
            Ref::parse("custom/region"),
            Err(ParseRefError::MissingRelease(_))
        ));
        assert!(matches!(
            Ref::parse("repo/-/pkg/@r#"),
            Err(ParseRefError::EmptyFragment(_))
        ));
    }

    #[test]
    fn relative_resolution_fills_package() {
        let base = Ref::parse("repo/-/pkg/@abc/deploy/prod/1").expect("parse should succeed");
        let rel = Ref::parse("+/custom/region").expect("parse should succeed");
        let resolved = rel.relative_to(&base);
        assert_eq!(resolved.to_string(), "repo/-/pkg/+/custom/region");

        // Already absolute: unchanged.
        let other = Ref::parse("other/-/x/@/deploy/a").expect("parse should succeed");
        assert_eq!(other.relative_to(&base), other);
    }

    #[test]
    fn discriminant_flips_preserve_path() {
        let r = Ref::parse("repo/-/pkg/@abc/deploy/staging").expect("parse should succeed");
        assert_eq!(r.make_intent().to_string(), "repo/-/pkg/+/deploy/staging");
        assert_eq!(
            r.make_intent().make_release("def").to_string(),
            "repo/-/pkg/@def/deploy/staging"
        );

        let mut r = r;
        r.set_version("v2");
        assert_eq!(r.to_string(), "repo/-/pkg/@v2/deploy/staging");
    }

    #[test]
    fn parent_walks_up_to_release() {
        let r = Ref::parse("repo/-/pkg/@abc/deploy/staging/1#x").expect("parse should succeed");
        let p = r.parent().expect("parent should exist");
        assert_eq!(p.to_string(), "repo/-/pkg/@abc/deploy/staging");
        let p = p.parent().expect("parent should exist");
        assert_eq!(p.to_string(), "repo/-/pkg/@abc/deploy");
        let p = p.parent().expect("parent should exist");
        assert_eq!(p.to_string(), "repo/-/pkg/@abc");
        assert!(p.parent().is_none());
    }

    #[test]
    fn join_and_serde() {
        let r = Ref::package("repo", "pkg")
            .with_release(ReleaseOrIntent::Release("abc".to_string()))
            .with_sub_path(SubPathType::Deploy, "staging")
            .join_sub_path("4");
        assert_eq!(r.to_string(), "repo/-/pkg/@abc/deploy/staging/4");

        let json = serde_json::to_string(&r).expect("serialize should succeed");
        assert_eq!(json, "\"repo/-/pkg/@abc/deploy/staging/4\"");
        let back: Ref = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, r);
    }
}
