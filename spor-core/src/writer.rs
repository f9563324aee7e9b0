// vim: tw=80
//! The Write Orchestrator
//!
//! Writes patterns through the block I/O primitive and records each write in
//! the [`PatternRegistry`] once, and only once, it has been acknowledged.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    thread,
};
use tracing::{debug, info};

use crate::{
    blockio::BlockIo,
    pattern::Pattern,
    registry::PatternRegistry,
    scenario::ScenarioContext,
    types::{Error, Region, Result},
};

/// Records that `pattern` was written to `region`, and that the write was
/// acknowledged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteRecord {
    pub region:  Region,
    pub pattern: Arc<Pattern>,
    /// The number of crashes injected into the scenario before the write was
    /// acknowledged.
    pub epoch:   u64,
}

/// A bounded group of tasks that is joined as a unit.
///
/// At most `max_parallel` tasks run at once.  [`TaskGroup::run`] does not
/// return until every task has finished, successfully or not.
#[derive(Clone, Copy, Debug)]
pub struct TaskGroup {
    max_parallel: NonZeroUsize,
}

impl TaskGroup {
    pub fn new(max_parallel: NonZeroUsize) -> Self {
        TaskGroup { max_parallel }
    }

    /// Run every task, then return their results in task order.
    ///
    /// If any task fails, the group fails with the error of the lowest-indexed
    /// failing task, but only after all tasks have completed.
    pub fn run<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
        where F: FnOnce() -> Result<T> + Send,
              T: Send
    {
        let ntasks = tasks.len();
        let queue = Mutex::new(tasks.into_iter().enumerate());
        let results = Mutex::new(
            (0..ntasks).map(|_| None).collect::<Vec<Option<Result<T>>>>()
        );
        let nworkers = self.max_parallel.get().min(ntasks);
        thread::scope(|s| {
            for _ in 0..nworkers {
                let queue = &queue;
                let results = &results;
                s.spawn(move || loop {
                    let next = queue.lock().unwrap().next();
                    let Some((i, task)) = next else {
                        break;
                    };
                    let r = task();
                    results.lock().unwrap()[i] = Some(r);
                });
            }
        });
        // Every worker drained the queue before exiting, so every slot is
        // filled.
        results.into_inner()
            .unwrap()
            .into_iter()
            .flatten()
            .collect()
    }
}

pub struct WriteOrchestrator<'a> {
    io:       &'a dyn BlockIo,
    registry: &'a PatternRegistry,
    group:    TaskGroup,
}

impl<'a> WriteOrchestrator<'a> {
    pub fn new(io: &'a dyn BlockIo, registry: &'a PatternRegistry,
               max_parallel: NonZeroUsize) -> Self
    {
        WriteOrchestrator {
            io,
            registry,
            group: TaskGroup::new(max_parallel),
        }
    }

    /// Write a fresh pattern to `region`.
    ///
    /// The returned `WriteRecord` exists only if the write was acknowledged.
    /// `region` must not be empty.
    #[tracing::instrument(skip(self, ctx), fields(scenario = ctx.name()))]
    pub fn write(&self, ctx: &ScenarioContext, region: Region)
        -> Result<WriteRecord>
    {
        Self::check_nonempty(&[region])?;
        let pattern = self.registry.new_pattern(region.volume);
        self.write_pattern(ctx, region, pattern)
    }

    /// Write a fresh pattern to each region concurrently, one writer per
    /// region.
    ///
    /// Patterns are issued in request order before any writer starts, so the
    /// writer for `requests[i]` always owns the `i`th pattern issued by this
    /// call.  Returns only once every writer has finished.  No crash may be
    /// injected before then.
    #[tracing::instrument(skip_all, fields(scenario = ctx.name(),
                                           writers = requests.len()))]
    pub fn write_concurrently(&self, ctx: &ScenarioContext, requests: &[Region])
        -> Result<Vec<WriteRecord>>
    {
        Self::check_nonempty(requests)?;
        let tasks = requests.iter()
            .map(|&region| {
                let pattern = self.registry.new_pattern(region.volume);
                move || self.write_pattern(ctx, region, pattern)
            }).collect::<Vec<_>>();
        let records = self.group.run(tasks)?;
        info!(writers = records.len(), "write barrier reached");
        Ok(records)
    }

    fn check_nonempty(regions: &[Region]) -> Result<()> {
        match regions.iter().find(|r| r.is_empty()) {
            Some(r) => {
                Err(Error::Config(format!("cannot write empty region {r}")))
            }
            None => Ok(())
        }
    }

    fn write_pattern(
        &self,
        ctx: &ScenarioContext,
        region: Region,
        pattern: Arc<Pattern>
    ) -> Result<WriteRecord>
    {
        let buf = pattern.generate(region.len());
        self.io.write(region.volume, region.offset, &buf)
            .map_err(|source| Error::Write { region, source })?;
        let record = WriteRecord {
            region,
            pattern,
            epoch: ctx.epoch(),
        };
        debug!(%region, pattern = %record.pattern.id(), "write acknowledged");
        self.registry.complete(record.clone());
        Ok(record)
    }
}
