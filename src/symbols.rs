//! Symbolization seam. The session owns no symbol tables of its own: a
//! [`SymbolCache`] implementation hands out per-process resolvers and the
//! kernel symbol table, ages them by harvest round, and evicts dead pids.

use serde::Serialize;

/// Resolution result for one instruction pointer. An empty `name` with a
/// non-empty `module` means the address fell inside a known mapping whose
/// symbol could not be determined; both empty means the module itself is
/// unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub module: String,
    pub start: u64,
}

pub trait SymbolResolver {
    fn resolve(&self, address: u64) -> Symbol;
}

/// Per-process symbol table. The cache stays the owner; harvest borrows a
/// table for at most one round and must not hold on to it.
pub trait ProcTable: SymbolResolver {
    fn pid(&self) -> u32;

    /// A permanent failure loading this process's tables. Pids whose tables
    /// error are marked dead and reaped at the next cleanup.
    fn error(&self) -> Option<&anyhow::Error>;
}

/// Sizing of one generational cache: `size` live entries, each kept for
/// `keep_rounds` harvest rounds after its last use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GCacheOptions {
    pub size: usize,
    pub keep_rounds: usize,
}

impl Default for GCacheOptions {
    fn default() -> Self {
        Self {
            size: 512,
            keep_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub pid_cache: GCacheOptions,
    pub build_id_cache: GCacheOptions,
    pub same_file_cache: GCacheOptions,
}

/// Point-in-time counters reported by a cache implementation, surfaced
/// through the session's debug info.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub proc_tables: usize,
    pub kernel_symbols: usize,
    pub round: u64,
}

pub trait SymbolCache: Send {
    /// Called once at the top of every harvest round.
    fn next_round(&mut self);

    fn proc_table(&mut self, pid: u32) -> &dyn ProcTable;

    fn kallsyms(&mut self) -> &dyn SymbolResolver;

    fn remove_dead_pid(&mut self, pid: u32);

    /// Round-based aging, called at the end of every harvest.
    fn cleanup(&mut self);

    fn update_options(&mut self, options: &CacheOptions);

    fn stats(&self) -> CacheStats;
}
