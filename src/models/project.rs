use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;
use crate::errors::FieldError;

pub const MAX_PROJECT_NAME_LEN: usize = 100;
const MAX_PATH_LEN: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub file_tree: FileTree,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// A fresh project whose only member is its creator.
    pub fn new(name: String, creator_id: &str) -> Self {
        let now = Utc::now();
        Project {
            id: Uuid::new_v4().to_string(),
            name,
            members: vec![creator_id.to_string()],
            file_tree: FileTree::default(),
            messages: Vec::new(),
            created_by: creator_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    /// Messages newer than `since` (exclusive), optionally limited to one
    /// session. Clients poll with the timestamp of the last message they hold.
    pub fn messages_since(&self, since: Option<DateTime<Utc>>, session_id: Option<&str>) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| since.map_or(true, |t| m.created_at > t))
            .filter(|m| session_id.map_or(true, |s| m.session_id.as_deref() == Some(s)))
            .cloned()
            .collect()
    }
}

/// Trims the name and checks it is present and not too long.
pub fn validate_project_name(name: Option<&str>) -> Result<String, FieldError> {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(FieldError::new("name", "Name is required"));
    }
    if name.chars().count() > MAX_PROJECT_NAME_LEN {
        return Err(FieldError::new(
            "name",
            format!("Name must be at most {} characters", MAX_PROJECT_NAME_LEN),
        ));
    }
    Ok(name.to_string())
}

/// Path → contents. Stored as a list of entries so that file names with dots
/// never end up as document keys. Clients may send either the list or a plain
/// `{"path": "contents"}` object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "FileTreeRepr", into = "Vec<FileEntry>")]
pub struct FileTree(pub BTreeMap<String, String>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub contents: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileTreeRepr {
    Entries(Vec<FileEntry>),
    Map(BTreeMap<String, String>),
}

impl From<FileTreeRepr> for FileTree {
    fn from(repr: FileTreeRepr) -> Self {
        match repr {
            FileTreeRepr::Entries(entries) => {
                FileTree(entries.into_iter().map(|e| (e.path, e.contents)).collect())
            }
            FileTreeRepr::Map(map) => FileTree(map),
        }
    }
}

impl From<FileTree> for Vec<FileEntry> {
    fn from(tree: FileTree) -> Self {
        tree.0
            .into_iter()
            .map(|(path, contents)| FileEntry { path, contents })
            .collect()
    }
}

impl FileTree {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let errors: Vec<FieldError> = self
            .0
            .keys()
            .filter_map(|path| {
                check_path(path).err().map(|msg| {
                    FieldError::new("file_tree", format!("{}: {}", display_path(path), msg))
                })
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<empty>"
    } else {
        path
    }
}

fn check_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("path is empty");
    }
    if path.len() > MAX_PATH_LEN {
        return Err("path is too long");
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err("path must be relative and use forward slashes");
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err("path contains an empty or '..' segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn creator_is_sole_member() {
        let project = Project::new("demo".into(), "u1");
        assert_eq!(project.members, vec!["u1".to_string()]);
        assert!(project.is_member("u1"));
        assert!(!project.is_member("u2"));
    }

    #[test]
    fn name_is_required() {
        assert_eq!(validate_project_name(None).unwrap_err().field, "name");
        assert!(validate_project_name(Some("   ")).is_err());
        assert_eq!(validate_project_name(Some("  demo ")).unwrap(), "demo");
        assert!(validate_project_name(Some("x".repeat(101).as_str())).is_err());
    }

    #[test]
    fn file_tree_serializes_as_entries() {
        let tree: FileTree = serde_json::from_str(
            r#"[{"path":"src/app.js","contents":"x"},{"path":"package.json","contents":"{}"}]"#,
        )
        .unwrap();
        assert_eq!(tree.get("src/app.js"), Some("x"));
        let json = serde_json::to_value(&tree).unwrap();
        // BTreeMap ordering
        assert_eq!(json[0]["path"], "package.json");

        let from_map: FileTree = serde_json::from_str(r#"{"index.html":"<p></p>"}"#).unwrap();
        assert_eq!(from_map.get("index.html"), Some("<p></p>"));
    }

    #[test]
    fn rejects_escaping_paths() {
        let mut tree = FileTree::default();
        tree.0.insert("../etc/passwd".into(), String::new());
        tree.0.insert("/abs.txt".into(), String::new());
        tree.0.insert("ok/file.rs".into(), String::new());
        let errors = tree.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn messages_since_filters_by_time_and_session() {
        let mut project = Project::new("demo".into(), "u1");
        let base = Utc::now();
        for (i, session) in ["a", "b", "a"].iter().enumerate() {
            project.messages.push(Message {
                id: i.to_string(),
                sender: "u1".into(),
                sender_name: None,
                text: "hi".into(),
                session_id: Some(session.to_string()),
                model_type: None,
                created_at: base + Duration::seconds(i as i64),
            });
        }
        assert_eq!(project.messages_since(Some(base), None).len(), 2);
        let ids: Vec<_> = project
            .messages_since(None, Some("a"))
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["0", "2"]);
    }
}
