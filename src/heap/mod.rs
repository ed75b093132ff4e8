pub(crate) mod control;
#[allow(clippy::module_inception)]
pub(crate) mod heap;
pub(crate) mod locate;
pub(crate) mod loom_tests;
pub(crate) mod pages;
pub(crate) mod slots;
pub(crate) mod stats;
pub(crate) mod thread_cache;
pub(crate) mod varblock;
pub(crate) mod zone;

#[cfg(test)]
crate::sync::global_static! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
