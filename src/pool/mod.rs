pub(crate) mod arena;
pub(crate) mod buffer;
pub(crate) mod class;
pub(crate) mod header;
pub(crate) mod shared;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
