//! Merge rules for applying push events to cached collections.
//!
//! Every function mutates the collection in place and reports whether it
//! changed. Payloads reach this module already decoded, so identities are
//! always present.

/// A collection element with a stable identity.
pub trait Identified {
    type Id: PartialEq;

    fn identity(&self) -> Self::Id;
}

/// A single change to an identified collection.
pub enum CollectionEvent<T: Identified> {
    Replace(Vec<T>),
    Append(T),
    Update(T),
    Remove(T::Id),
}

/// Applies `event` to `items`. Returns `true` if `items` changed.
pub fn apply<T: Identified>(items: &mut Vec<T>, event: CollectionEvent<T>) -> bool {
    match event {
        CollectionEvent::Replace(next) => {
            *items = next;
            true
        }
        CollectionEvent::Append(item) => {
            items.push(item);
            true
        }
        CollectionEvent::Update(item) => update_by_id(items, item),
        CollectionEvent::Remove(id) => remove_by_id(items, &id),
    }
}

/// Replaces the first element sharing `item`'s identity, keeping its
/// position. A miss never appends.
pub fn update_by_id<T: Identified>(items: &mut [T], item: T) -> bool {
    let id = item.identity();
    match items.iter_mut().find(|existing| existing.identity() == id) {
        Some(slot) => {
            *slot = item;
            true
        }
        None => false,
    }
}

/// Removes only the first element with identity `id`.
pub fn remove_by_id<T: Identified>(items: &mut Vec<T>, id: &T::Id) -> bool {
    match items.iter().position(|existing| existing.identity() == *id) {
        Some(index) => {
            items.remove(index);
            true
        }
        None => false,
    }
}

/// Applies a typing-state change to the set of users currently typing.
pub fn apply_typing(typing: &mut Vec<String>, username: &str, is_typing: bool) -> bool {
    let position = typing.iter().position(|name| name == username);
    match (position, is_typing) {
        (None, true) => {
            typing.push(username.to_string());
            true
        }
        (Some(index), false) => {
            typing.remove(index);
            true
        }
        _ => false,
    }
}
