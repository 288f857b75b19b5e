/// Server copy of each document, optionally persisted as JSON files
use collab_mesh::DocumentSnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct DocumentStore {
    storage_path: Option<PathBuf>,
    documents: RwLock<HashMap<String, DocumentSnapshot>>,
}

impl DocumentStore {
    /// Documents live only as long as the process
    pub fn in_memory() -> Self {
        Self {
            storage_path: None,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Load every `<document_id>.json` under `storage_path`
    pub fn open(storage_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path)?;

        let mut documents = HashMap::new();
        for entry in fs::read_dir(&storage_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(document_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<DocumentSnapshot>(&data) {
                Ok(document) => {
                    documents.insert(document_id.to_string(), document);
                }
                Err(e) => tracing::warn!("skipping unreadable document {}: {}", path.display(), e),
            }
        }

        Ok(Self {
            storage_path: Some(storage_path),
            documents: RwLock::new(documents),
        })
    }

    /// Stored copy of `document_id`; an unknown document is empty
    pub fn get(&self, document_id: &str) -> DocumentSnapshot {
        self.documents
            .read()
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn put(&self, document_id: &str, document: DocumentSnapshot) -> anyhow::Result<()> {
        if let Some(storage_path) = &self.storage_path {
            let json = serde_json::to_string_pretty(&document)?;
            fs::write(storage_path.join(format!("{}.json", document_id)), json)?;
        }
        self.documents
            .write()
            .insert(document_id.to_string(), document);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }
}

/// Document ids double as file names, so keep them to a safe alphabet
pub fn is_valid_document_id(document_id: &str) -> bool {
    !document_id.is_empty()
        && document_id.len() <= 128
        && document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
