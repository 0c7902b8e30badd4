//! Hierarchical tag vocabulary of a picture bank.
//!
//! Tags form a rooted tree. The root is synthetic: it always has id
//! [`ROOT_TAG_ID`], is neither editable nor selectable, and is never stored.
//! Every operation writes SQL first and only then updates the in-memory maps,
//! so a failing operation leaves the repository unchanged.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db::Database;
use crate::error::{DbError, TagError};
use crate::events::{BankEvent, EventBus};

pub type TagId = u32;

pub const ROOT_TAG_ID: TagId = 0;
pub const ROOT_TAG_NAME: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub description: String,
    /// `None` only for the root.
    pub parent_id: Option<TagId>,
    /// A non-selectable tag is a pure category and can't be put on a picture.
    pub selectable: bool,
    pub editable: bool,
}

impl Tag {
    pub fn root() -> Self {
        Self {
            id: ROOT_TAG_ID,
            name: ROOT_TAG_NAME.to_string(),
            description: String::new(),
            parent_id: None,
            selectable: false,
            editable: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_TAG_ID
    }
}

/// Lexical rules for tag names.
pub fn validate_tag_name(name: &str) -> Result<(), TagError> {
    if name.trim().is_empty() || name.chars().any(char::is_control) {
        return Err(TagError::MalformedTagName(name.to_string()));
    }
    Ok(())
}

struct TagState {
    tags: BTreeMap<TagId, Tag>,
    /// `None` once every id has been handed out.
    next_id: Option<TagId>,
}

impl TagState {
    fn find_named(&self, name: &str) -> Option<&Tag> {
        self.tags.values().find(|t| t.name == name)
    }

    fn has_children(&self, id: TagId) -> bool {
        self.tags.values().any(|t| t.parent_id == Some(id))
    }

    /// True if `ancestor` is `id` itself or lies on the path from `id` to root.
    fn is_ancestor_or_self(&self, ancestor: TagId, id: TagId) -> bool {
        let mut current = Some(id);
        // Bounded by the tag count so a corrupt stored graph can't loop forever
        for _ in 0..=self.tags.len() {
            match current {
                Some(c) if c == ancestor => return true,
                Some(c) => current = self.tags.get(&c).and_then(|t| t.parent_id),
                None => return false,
            }
        }
        true
    }
}

/// In-memory view of the tag table plus the operations that change it.
pub struct TagRepository {
    bank_id: u32,
    db: Arc<Database>,
    bus: Arc<EventBus>,
    state: RwLock<TagState>,
}

impl TagRepository {
    /// Load every stored tag and add the synthetic root.
    pub fn load(bank_id: u32, db: Arc<Database>, bus: Arc<EventBus>) -> Result<Self, DbError> {
        let mut tags: BTreeMap<TagId, Tag> = db
            .load_tags()?
            .into_iter()
            .filter(|t| t.id != ROOT_TAG_ID)
            .map(|t| (t.id, t))
            .collect();
        tags.insert(ROOT_TAG_ID, Tag::root());

        let after_loaded = tags
            .keys()
            .next_back()
            .map_or(Some(1), |max| max.checked_add(1));
        let next_id = match (db.next_tag_id()?, after_loaded) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };

        tracing::debug!(bank_id, tags = tags.len() - 1, "Loaded tags");

        Ok(Self {
            bank_id,
            db,
            bus,
            state: RwLock::new(TagState { tags, next_id }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, TagState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TagState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> Tag {
        Tag::root()
    }

    pub fn get_tag(&self, id: TagId) -> Option<Tag> {
        self.read().tags.get(&id).cloned()
    }

    pub fn has_tag(&self, id: TagId) -> bool {
        self.read().tags.contains_key(&id)
    }

    pub fn get_tag_named(&self, name: &str) -> Option<Tag> {
        self.read().find_named(name).cloned()
    }

    pub fn has_tag_named(&self, name: &str) -> bool {
        self.read().find_named(name).is_some()
    }

    /// Snapshot of every tag, root included, sorted by id.
    pub fn tag_set(&self) -> Vec<Tag> {
        self.read().tags.values().cloned().collect()
    }

    /// Direct children of `id`, sorted by id.
    pub fn children(&self, id: TagId) -> Vec<Tag> {
        self.read()
            .tags
            .values()
            .filter(|t| t.parent_id == Some(id))
            .cloned()
            .collect()
    }

    pub fn add_tag(
        &self,
        parent: TagId,
        name: &str,
        description: &str,
        selectable: bool,
    ) -> Result<Tag, TagError> {
        validate_tag_name(name)?;

        let tag = {
            let mut state = self.write();
            if state.find_named(name).is_some() {
                return Err(TagError::DuplicateTagName(name.to_string()));
            }
            if !state.tags.contains_key(&parent) {
                return Err(TagError::IllegalTagId(parent));
            }
            let id = state.next_id.ok_or(TagError::NoMoreIds)?;

            let tag = Tag {
                id,
                name: name.to_string(),
                description: description.to_string(),
                parent_id: Some(parent),
                selectable,
                editable: true,
            };
            self.db.insert_tag(&tag).map_err(TagError::SqlInsertError)?;

            state.next_id = id.checked_add(1);
            state.tags.insert(id, tag.clone());
            tag
        };

        tracing::info!(bank_id = self.bank_id, tag_id = tag.id, name = %tag.name, "Added tag");
        self.publish(tag.id);
        Ok(tag)
    }

    pub fn edit_tag(
        &self,
        id: TagId,
        parent: TagId,
        name: &str,
        description: &str,
        selectable: bool,
    ) -> Result<Tag, TagError> {
        validate_tag_name(name)?;

        let tag = {
            let mut state = self.write();
            let current = state.tags.get(&id).ok_or(TagError::IllegalTagId(id))?;
            if !current.editable {
                return Err(TagError::UneditableTag(id));
            }
            if state.find_named(name).is_some_and(|t| t.id != id) {
                return Err(TagError::DuplicateTagName(name.to_string()));
            }
            if !state.tags.contains_key(&parent) || state.is_ancestor_or_self(id, parent) {
                return Err(TagError::IllegalTagId(parent));
            }

            let tag = Tag {
                id,
                name: name.to_string(),
                description: description.to_string(),
                parent_id: Some(parent),
                selectable,
                editable: true,
            };
            self.db.update_tag(&tag).map_err(TagError::SqlInsertError)?;
            state.tags.insert(id, tag.clone());
            tag
        };

        tracing::info!(bank_id = self.bank_id, tag_id = id, name = %tag.name, "Edited tag");
        self.publish(id);
        Ok(tag)
    }

    /// Remove a leaf tag. Its picture assignments are deleted with it.
    pub fn remove_tag(&self, id: TagId) -> Result<Tag, TagError> {
        if id == ROOT_TAG_ID {
            return Err(TagError::IllegalTagId(id));
        }

        let removed = {
            let mut state = self.write();
            let tag = state.tags.get(&id).ok_or(TagError::IllegalTagId(id))?;
            if !tag.editable {
                return Err(TagError::UneditableTag(id));
            }
            if state.has_children(id) {
                return Err(TagError::TagHasChildren(id));
            }
            self.db.delete_tag(id).map_err(TagError::SqlRemovalError)?;
            state.tags.remove(&id)
        };

        let removed = removed.ok_or(TagError::IllegalTagId(id))?;
        tracing::info!(bank_id = self.bank_id, tag_id = id, name = %removed.name, "Removed tag");
        self.publish(id);
        Ok(removed)
    }

    fn publish(&self, tag_id: TagId) {
        self.bus.publish(BankEvent::TagChanged {
            bank_id: self.bank_id,
            tag_id,
        });
    }
}
