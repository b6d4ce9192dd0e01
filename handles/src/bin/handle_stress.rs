//! Stress driver for the handle stores.
//!
//! Every iteration acquires a store from a shared pool, opens `--depth`
//! nested scopes holding `--per-scope` handles each, runs a relocating
//! "collection" over all roots at the innermost level and checks on the way
//! out that every handle saw exactly one rewrite.
//!
//!   RUST_LOG=debug cargo run --features cli --bin handle_stress -- --trace --depth 4
//!   cargo run --release --features cli --bin handle_stress -- --arena zone --threads 8

use std::{
    cell::Cell,
    process,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};

use handles::{
    BlockArena, ContextPool, Handle, HandleConfig, HandleScope, HandleStore, SystemArena,
    VM_HANDLES_PER_BLOCK, Value, VmHandles, Zone, ZoneSettings,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ArenaKind {
    System,
    Zone,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Iterations per worker thread
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    /// Worker threads sharing one store pool
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Nested scopes per iteration
    #[arg(long, default_value_t = 8)]
    depth: usize,

    /// Scoped handles allocated in each scope
    #[arg(long, default_value_t = 100)]
    per_scope: usize,

    /// Zone handles allocated per iteration
    #[arg(long, default_value_t = 64)]
    zone: usize,

    /// Log store life cycle events (needs RUST_LOG=debug)
    #[arg(long)]
    trace: bool,

    /// Where handle blocks come from
    #[arg(long, value_enum, default_value_t = ArenaKind::System)]
    arena: ArenaKind,

    /// Zone chunk size in bytes
    #[arg(long, default_value_t = 65_536)]
    chunk_size: usize,

    /// Upper bound on bytes mapped per zone
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Default)]
struct Stats {
    zone_handles: usize,
    scoped_handles: usize,
    relocated: usize,
    incremental: usize,
    max_scoped_blocks: usize,
}

impl Stats {
    fn merge(&mut self, other: Stats) {
        self.zone_handles += other.zone_handles;
        self.scoped_handles += other.scoped_handles;
        self.relocated += other.relocated;
        self.incremental += other.incremental;
        self.max_scoped_blocks = self.max_scoped_blocks.max(other.max_scoped_blocks);
    }
}

type Scope<'s, A> = HandleScope<'s, Value, VM_HANDLES_PER_BLOCK, A>;

fn fixnum(n: usize) -> Value {
    Value::from_i64(n as i64)
}

/// Bumps every fixnum root by one, standing in for a moving collector.
fn relocate<A: BlockArena>(store: &HandleStore<Value, VM_HANDLES_PER_BLOCK, A>) -> usize {
    let mut relocated = 0;
    store.visit_object_pointers(&mut |slot: &Cell<Value>| {
        let value = slot.get();
        if value.is_fixnum() {
            // SAFETY: checked above
            slot.set(Value::from_i64(unsafe { value.to_i64() } + 1));
            relocated += 1;
        }
    });
    relocated
}

fn descend<A: BlockArena>(scope: &Scope<'_, A>, level: usize, cli: &Cli, stats: &mut Stats) {
    let base = level * cli.per_scope;
    let handles: Vec<Handle<'_, Value>> = (0..cli.per_scope)
        .map(|i| scope.handle(fixnum(base + i)))
        .collect();
    stats.scoped_handles += handles.len();

    let mut fresh = 0;
    scope
        .store()
        .visit_unvisited_scoped_handles(&mut |_: &Cell<Value>| fresh += 1);
    stats.incremental += fresh;

    if level + 1 < cli.depth {
        let inner = scope.nested();
        descend(&inner, level + 1, cli, stats);
    } else {
        let store = scope.store();
        stats.max_scoped_blocks = stats.max_scoped_blocks.max(store.scoped_block_count());
        stats.relocated += relocate(store);
    }

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(
            handle.value(),
            fixnum(base + i + 1),
            "scoped handle {i} at depth {level} was not relocated exactly once"
        );
    }
}

fn run_iteration<A: BlockArena>(store: &VmHandles<A>, cli: &Cli, stats: &mut Stats) {
    let zone: Vec<Handle<'_, Value>> = (0..cli.zone).map(|i| store.zone_handle(fixnum(i))).collect();
    stats.zone_handles += zone.len();

    store.with_scope(|scope| descend(scope, 0, cli, stats));
    assert_eq!(store.count_scoped_handles(), 0, "scoped handles leaked");

    for (i, handle) in zone.iter().enumerate() {
        assert_eq!(handle.value(), fixnum(i + 1), "zone handle {i} lost its relocation");
    }
}

fn run<A>(cli: &Cli, pool: &ContextPool<VmHandles<A>>) -> Stats
where
    A: BlockArena + Send,
{
    std::thread::scope(|s| {
        let workers: Vec<_> = (0..cli.threads)
            .map(|_| {
                s.spawn(|| {
                    let mut stats = Stats::default();
                    for _ in 0..cli.iterations {
                        let store = pool.acquire();
                        run_iteration(&store, cli, &mut stats);
                        pool.release(store);
                    }
                    stats
                })
            })
            .collect();

        let mut total = Stats::default();
        for worker in workers {
            match worker.join() {
                Ok(stats) => total.merge(stats),
                Err(_) => {
                    log::error!("stress worker panicked");
                    process::exit(1);
                }
            }
        }
        total
    })
}

fn report(cli: &Cli, stats: &Stats, elapsed: Duration, created: usize, recycled: usize) {
    let total = stats.zone_handles + stats.scoped_handles;
    println!("arena:             {:?}", cli.arena);
    println!("threads:           {}", cli.threads);
    println!("iterations:        {}", cli.iterations * cli.threads);
    println!("zone handles:      {}", stats.zone_handles);
    println!("scoped handles:    {}", stats.scoped_handles);
    println!("incremental visit: {}", stats.incremental);
    println!("relocated roots:   {}", stats.relocated);
    println!("max scoped blocks: {}", stats.max_scoped_blocks);
    println!("stores created:    {created} (recycled {recycled})");
    println!(
        "elapsed:           {:.3}s ({:.1} ns/handle)",
        elapsed.as_secs_f64(),
        elapsed.as_nanos() as f64 / total.max(1) as f64
    );
}

fn main() {
    env_logger::init();
    let mut cli = Cli::parse();
    cli.depth = cli.depth.max(1);
    cli.threads = cli.threads.max(1);

    let config = HandleConfig {
        trace_handles: cli.trace,
    };
    let start = Instant::now();

    let (stats, created, recycled) = match cli.arena {
        ArenaKind::System => {
            let pool = ContextPool::new(cli.threads, move || {
                VmHandles::with_arena(SystemArena, config.clone())
            });
            let stats = run(&cli, &pool);
            (stats, pool.created_count(), pool.recycled_count())
        }
        ArenaKind::Zone => {
            let settings = ZoneSettings {
                chunk_size: cli.chunk_size,
                limit: cli.limit,
            };
            if let Err(err) = settings.validate() {
                eprintln!("Error: {err}");
                process::exit(2);
            }
            let pool = ContextPool::new(cli.threads, move || {
                let zone = match Zone::new(settings.clone()) {
                    Ok(zone) => zone,
                    Err(err) => {
                        log::error!("cannot create zone: {err}");
                        process::exit(1);
                    }
                };
                VmHandles::with_arena(zone, config.clone())
            });
            let stats = run(&cli, &pool);
            (stats, pool.created_count(), pool.recycled_count())
        }
    };

    report(&cli, &stats, start.elapsed(), created, recycled);
}
