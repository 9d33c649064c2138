//! Safe pointer registry.
//!
//! Pointers handed to the interpreter are registered together with their
//! type tag so later uses can be checked against use-after-free and
//! wrong-type errors. Counted pointers may be registered several times and
//! stay valid until disposed as many times.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::{AlienError, Context, ErrorCode, PointerValue, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Safe,
    Counted(usize),
}

#[derive(Debug, Clone)]
struct Registration {
    tag: Option<String>,
    kind: PointerKind,
}

#[derive(Default)]
pub struct PointerRegistry {
    entries: Mutex<HashMap<usize, Registration>>,
    /// subtag -> tags it may be used as
    castables: RwLock<HashMap<String, HashSet<String>>>,
}

impl PointerRegistry {
    pub fn register(&self, ptr: &PointerValue, counted: bool) -> Result<()> {
        if ptr.is_null() {
            return Err(AlienError::new(
                ErrorCode::PointerRegistration,
                "Attempt to register null pointer.",
            ));
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(&ptr.address) {
            None => {
                log::trace!("registering pointer {ptr}");
                entries.insert(
                    ptr.address,
                    Registration {
                        tag: ptr.tag.clone(),
                        kind: if counted {
                            PointerKind::Counted(1)
                        } else {
                            PointerKind::Safe
                        },
                    },
                );
                Ok(())
            }
            Some(existing) if existing.tag != ptr.tag => Err(AlienError::new(
                ErrorCode::PointerRegistration,
                format!(
                    "Pointer {ptr} is already registered with tag \"{}\".",
                    existing.tag.as_deref().unwrap_or("")
                ),
            )),
            Some(existing) => match (&mut existing.kind, counted) {
                (PointerKind::Counted(n), true) => {
                    *n += 1;
                    Ok(())
                }
                (PointerKind::Safe, false) => Ok(()),
                _ => Err(AlienError::new(
                    ErrorCode::PointerRegistration,
                    format!(
                        "Pointer {ptr} is already registered as a different kind."
                    ),
                )),
            },
        }
    }

    /// Removes a registration, or drops one reference of a counted
    /// pointer.
    pub fn unregister(&self, ptr: &PointerValue) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(existing) = entries.get_mut(&ptr.address) else {
            return Err(AlienError::not_registered(&Value::Pointer(ptr.clone())));
        };
        if existing.tag != ptr.tag {
            return Err(AlienError::tag_mismatch(
                existing.tag.as_deref().unwrap_or(""),
                &Value::Pointer(ptr.clone()),
            ));
        }
        match &mut existing.kind {
            PointerKind::Counted(n) if *n > 1 => *n -= 1,
            _ => {
                log::trace!("unregistering pointer {ptr}");
                entries.remove(&ptr.address);
            }
        }
        Ok(())
    }

    /// Verifies `ptr` is registered under its own tag.
    pub fn check(&self, ptr: &PointerValue) -> Result<()> {
        match self.entries.lock().get(&ptr.address) {
            Some(reg) if reg.tag == ptr.tag => Ok(()),
            Some(reg) => Err(AlienError::tag_mismatch(
                reg.tag.as_deref().unwrap_or(""),
                &Value::Pointer(ptr.clone()),
            )),
            None => Err(AlienError::not_registered(&Value::Pointer(ptr.clone()))),
        }
    }

    pub fn is_registered(&self, ptr: &PointerValue) -> bool {
        self.check(ptr).is_ok()
    }

    pub fn kind(&self, ptr: &PointerValue) -> Option<PointerKind> {
        self.entries.lock().get(&ptr.address).map(|r| r.kind)
    }

    pub fn list(&self, tag: Option<&str>) -> Vec<PointerValue> {
        let mut out: Vec<PointerValue> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, reg)| tag.is_none() || reg.tag.as_deref() == tag)
            .map(|(addr, reg)| PointerValue::new(*addr, reg.tag.as_deref()))
            .collect();
        out.sort_by_key(|p| p.address);
        out
    }

    /// Drops the registration at `address` regardless of kind and count.
    pub fn forget(&self, address: usize) {
        self.entries.lock().remove(&address);
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn add_castable(&self, subtag: &str, supertag: &str) {
        self.castables
            .write()
            .entry(subtag.to_string())
            .or_default()
            .insert(supertag.to_string());
    }

    /// A pointer tagged `have` may be used where `want` is required if
    /// the tags are equal, `want` is untagged, or `have` is declared
    /// castable to `want` directly or transitively.
    pub fn tag_compatible(&self, have: Option<&str>, want: Option<&str>) -> bool {
        let Some(want) = want else { return true };
        let Some(have) = have else { return false };
        if have == want {
            return true;
        }
        let castables = self.castables.read();
        let mut seen = HashSet::new();
        let mut pending = vec![have];
        while let Some(tag) = pending.pop() {
            if !seen.insert(tag) {
                continue;
            }
            if let Some(supers) = castables.get(tag) {
                for s in supers {
                    if s == want {
                        return true;
                    }
                    pending.push(s);
                }
            }
        }
        false
    }
}

impl Context {
    /// Wraps an address as a registered safe pointer.
    pub fn pointer_safe(&self, address: usize, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = PointerValue::new(address, tag);
        self.pointers.register(&ptr, false)?;
        Ok(ptr)
    }

    pub fn pointer_counted(&self, address: usize, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = PointerValue::new(address, tag);
        self.pointers.register(&ptr, true)?;
        Ok(ptr)
    }

    pub fn pointer_check(&self, ptr: &Value) -> Result<()> {
        let ptr = ptr.as_pointer()?;
        if ptr.is_null() {
            return Err(AlienError::null_not_allowed());
        }
        self.pointers.check(&ptr)
    }

    pub fn pointer_dispose(&self, ptr: &Value) -> Result<()> {
        let ptr = ptr.as_pointer()?;
        if ptr.is_null() {
            return Ok(());
        }
        self.pointers.unregister(&ptr)
    }

    pub fn pointer_is_valid(&self, ptr: &Value) -> bool {
        ptr.as_pointer()
            .map(|p| !p.is_null() && self.pointers.is_registered(&p))
            .unwrap_or(false)
    }

    pub fn pointer_is_null(&self, ptr: &Value) -> Result<bool> {
        Ok(ptr.as_pointer()?.is_null())
    }

    pub fn pointer_address(&self, ptr: &Value) -> Result<usize> {
        Ok(ptr.as_pointer()?.address)
    }

    pub fn pointer_tag(&self, ptr: &Value) -> Result<Option<String>> {
        Ok(ptr.as_pointer()?.tag)
    }

    /// Stops tracking `ptr`. The value can still be passed where pointers
    /// are declared `unsafe`.
    pub fn pointer_make_unsafe(&self, ptr: &Value) -> Result<PointerValue> {
        let ptr = ptr.as_pointer()?;
        if !ptr.is_null() && self.pointers.kind(&ptr).is_some() {
            self.pointers.forget(ptr.address);
            log::trace!("pointer {ptr} is no longer tracked");
        }
        Ok(ptr)
    }

    /// Returns a pointer with the same address and a different tag. The
    /// source tag must be castable to the new tag, or one of the two must
    /// be untagged. Registration moves with the cast.
    pub fn pointer_cast(&self, ptr: &Value, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = ptr.as_pointer()?;
        let allowed = ptr.tag.is_none()
            || tag.is_none()
            || self.pointers.tag_compatible(ptr.tag.as_deref(), tag);
        if !allowed {
            return Err(AlienError::tag_mismatch(
                tag.unwrap_or(""),
                &Value::Pointer(ptr.clone()),
            ));
        }
        let cast = PointerValue::new(ptr.address, tag);
        if !ptr.is_null() && self.pointers.is_registered(&ptr) {
            let counted = matches!(self.pointers.kind(&ptr), Some(PointerKind::Counted(_)));
            self.pointers.unregister(&ptr)?;
            self.pointers.register(&cast, counted)?;
        }
        Ok(cast)
    }

    pub fn pointer_castable(&self, subtag: &str, supertag: &str) {
        self.pointers.add_castable(subtag, supertag);
    }

    pub fn pointer_list(&self, tag: Option<&str>) -> Vec<PointerValue> {
        self.pointers.list(tag)
    }

    pub fn pointer_invalidate_all(&self) -> usize {
        self.pointers.invalidate_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_registration_is_idempotent_per_tag() {
        let reg = PointerRegistry::default();
        let p = PointerValue::new(0x1000, Some("FILE"));
        reg.register(&p, false).unwrap();
        reg.register(&p, false).unwrap();
        let other = PointerValue::new(0x1000, Some("DIR"));
        assert_eq!(
            reg.register(&other, false).unwrap_err().code,
            ErrorCode::PointerRegistration
        );
        reg.unregister(&p).unwrap();
        assert!(!reg.is_registered(&p));
        assert!(reg.unregister(&p).is_err());
    }

    #[test]
    fn counted_pointers_need_matching_disposals() {
        let reg = PointerValue::new(0x2000, Some("buf"));
        let table = PointerRegistry::default();
        table.register(&reg, true).unwrap();
        table.register(&reg, true).unwrap();
        table.unregister(&reg).unwrap();
        assert!(table.is_registered(&reg));
        table.unregister(&reg).unwrap();
        assert!(!table.is_registered(&reg));
    }

    #[test]
    fn null_is_never_registered() {
        let table = PointerRegistry::default();
        assert!(table.register(&PointerValue::null(None), false).is_err());
    }

    #[test]
    fn castable_tags_are_transitive() {
        let table = PointerRegistry::default();
        table.add_castable("Dog", "Animal");
        table.add_castable("Animal", "Thing");
        assert!(table.tag_compatible(Some("Dog"), Some("Thing")));
        assert!(table.tag_compatible(Some("Dog"), None));
        assert!(!table.tag_compatible(Some("Thing"), Some("Dog")));
        assert!(!table.tag_compatible(None, Some("Dog")));
    }

    #[test]
    fn cast_moves_registration() {
        let ctx = Context::default();
        ctx.pointer_castable("Dog", "Animal");
        let dog = ctx.pointer_safe(0x3000, Some("Dog")).unwrap();
        let animal = ctx.pointer_cast(&Value::Pointer(dog.clone()), Some("Animal")).unwrap();
        assert!(ctx.pointer_is_valid(&Value::Pointer(animal)));
        assert!(!ctx.pointer_is_valid(&Value::Pointer(dog)));
        let cat = ctx.pointer_safe(0x4000, Some("Cat")).unwrap();
        assert!(ctx.pointer_cast(&Value::Pointer(cat), Some("Animal")).is_err());
    }

    #[test]
    fn accessors_and_untracking() {
        let ctx = Context::default();
        let p = Value::Pointer(ctx.pointer_counted(0x3000, Some("buf")).unwrap());
        ctx.pointer_counted(0x3000, Some("buf")).unwrap();
        assert_eq!(ctx.pointer_address(&p).unwrap(), 0x3000);
        assert_eq!(ctx.pointer_tag(&p).unwrap().as_deref(), Some("buf"));
        assert!(!ctx.pointer_is_null(&p).unwrap());
        assert!(ctx.pointer_is_null(&Value::Pointer(PointerValue::null(None))).unwrap());
        let unsafe_ptr = ctx.pointer_make_unsafe(&p).unwrap();
        assert_eq!(unsafe_ptr.address, 0x3000);
        assert!(!ctx.pointer_is_valid(&p), "all references are dropped");
    }
}
