//! Work package definitions loaded from a feature's `tasks/` directory.
//!
//! Each work package is a markdown file carrying YAML frontmatter
//! (`work_package_id`, `title`, `dependencies`) followed by the prompt body
//! that is handed to the coding agent verbatim.

use crate::errors::GraphError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A planned unit of work with a stable identifier and zero or more
/// dependencies on other work packages within the same feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub wp_id: String,
    pub title: String,
    pub dependencies: Vec<String>,
    /// Path to the markdown file whose body is the agent prompt.
    pub prompt_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Frontmatter {
    work_package_id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl WorkPackage {
    /// Parse a single task file into a work package.
    ///
    /// The frontmatter-derived id is authoritative. When it disagrees with the
    /// filename stem, the frontmatter wins; callers that want the disagreement
    /// warning should compare `wp_id` against [`filename_stem`] themselves.
    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let content = std::fs::read_to_string(path).map_err(|source| GraphError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let (frontmatter_src, _body) = split_frontmatter(&content).ok_or_else(|| {
            GraphError::MalformedFrontmatter {
                path: path.to_path_buf(),
                reason: "missing '---' delimited frontmatter block".to_string(),
            }
        })?;

        let frontmatter: Frontmatter =
            serde_yaml::from_str(frontmatter_src).map_err(|e| GraphError::MalformedFrontmatter {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let wp_id = frontmatter
            .work_package_id
            .ok_or_else(|| GraphError::MissingWorkPackageId {
                path: path.to_path_buf(),
            })?;

        Ok(WorkPackage {
            wp_id,
            title: frontmatter.title,
            dependencies: frontmatter.dependencies,
            prompt_path: path.to_path_buf(),
        })
    }

    /// The prompt body: file content with the frontmatter block stripped.
    pub fn prompt_body(&self) -> Result<String, GraphError> {
        let content =
            std::fs::read_to_string(&self.prompt_path).map_err(|source| GraphError::ReadFailed {
                path: self.prompt_path.clone(),
                source,
            })?;
        let (_fm, body) = split_frontmatter(&content).unwrap_or(("", content.as_str()));
        Ok(body.trim().to_string())
    }
}

/// Splits `---\n<yaml>\n---\n<body>` into `(yaml, body)`.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((yaml, body))
}

/// Load every work package found directly under `tasks_dir`.
///
/// Files are read in lexicographic filename order so that, combined with the
/// graph's own stable tie-break, scheduling order is reproducible across runs.
pub fn load_work_packages(tasks_dir: &Path) -> Result<Vec<WorkPackage>, GraphError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(tasks_dir)
        .map_err(|source| GraphError::ReadFailed {
            path: tasks_dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();

    let mut seen = std::collections::HashSet::new();
    let mut wps = Vec::with_capacity(paths.len());
    for path in paths {
        let wp = WorkPackage::from_file(&path)?;
        if !seen.insert(wp.wp_id.clone()) {
            return Err(GraphError::DuplicateWorkPackage { wp_id: wp.wp_id });
        }
        wps.push(wp);
    }
    Ok(wps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_task(dir: &Path, filename: &str, content: &str) -> PathBuf {
        let path = dir.join(filename);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_frontmatter_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            dir.path(),
            "wp01.md",
            "---\nwork_package_id: WP01\ntitle: Setup\ndependencies: []\n---\nDo the setup.\n",
        );
        let wp = WorkPackage::from_file(&path).unwrap();
        assert_eq!(wp.wp_id, "WP01");
        assert_eq!(wp.title, "Setup");
        assert!(wp.dependencies.is_empty());
        assert_eq!(wp.prompt_body().unwrap(), "Do the setup.");
    }

    #[test]
    fn parses_dependencies_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            dir.path(),
            "wp02.md",
            "---\nwork_package_id: WP02\ntitle: Core\ndependencies: [WP01]\n---\nBuild core.\n",
        );
        let wp = WorkPackage::from_file(&path).unwrap();
        assert_eq!(wp.dependencies, vec!["WP01".to_string()]);
    }

    #[test]
    fn missing_work_package_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(dir.path(), "wp03.md", "---\ntitle: No id\n---\nBody.\n");
        let err = WorkPackage::from_file(&path).unwrap_err();
        assert!(matches!(err, GraphError::MissingWorkPackageId { .. }));
    }

    #[test]
    fn missing_frontmatter_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(dir.path(), "wp04.md", "No frontmatter here.\n");
        let err = WorkPackage::from_file(&path).unwrap_err();
        assert!(matches!(err, GraphError::MalformedFrontmatter { .. }));
    }

    #[test]
    fn load_work_packages_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        write_task(
            dir.path(),
            "a.md",
            "---\nwork_package_id: WP01\ndependencies: []\n---\nx\n",
        );
        write_task(
            dir.path(),
            "b.md",
            "---\nwork_package_id: WP01\ndependencies: []\n---\ny\n",
        );
        let err = load_work_packages(dir.path()).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateWorkPackage { .. }));
    }

    #[test]
    fn load_work_packages_is_sorted_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_task(
            dir.path(),
            "b.md",
            "---\nwork_package_id: WP02\ndependencies: []\n---\ny\n",
        );
        write_task(
            dir.path(),
            "a.md",
            "---\nwork_package_id: WP01\ndependencies: []\n---\nx\n",
        );
        let wps = load_work_packages(dir.path()).unwrap();
        assert_eq!(wps[0].wp_id, "WP01");
        assert_eq!(wps[1].wp_id, "WP02");
    }
}
