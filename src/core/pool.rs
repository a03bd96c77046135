//! Pool of reusable request contexts.
//!
//! `acquire` pops an idle context (or builds one) and resets it for the new request;
//! dropping the returned guard resets the context again and returns it to the pool, so
//! an idle context never holds a previous request's data.
use std::{
    net::SocketAddr,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use hyper::{Request, http::request::Parts};
use scc::Bag;
use serde::Serialize;

use crate::core::context::{ContextServices, RequestContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Contexts constructed over the pool's lifetime
    pub created: usize,
    /// Contexts currently waiting for reuse
    pub idle: usize,
}

pub struct ContextPool {
    idle: Bag<Box<RequestContext>>,
    idle_count: AtomicUsize,
    created: AtomicUsize,
    max_idle: usize,
    services: Arc<ContextServices>,
}

fn empty_parts() -> Parts {
    Request::new(()).into_parts().0
}

impl ContextPool {
    pub fn new(max_idle: usize, services: Arc<ContextServices>) -> Self {
        Self {
            idle: Bag::default(),
            idle_count: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            max_idle,
            services,
        }
    }

    pub fn services(&self) -> &Arc<ContextServices> {
        &self.services
    }

    /// Take a context bound to `parts`. Never fails.
    pub fn acquire(&self, parts: Parts, remote_addr: Option<SocketAddr>) -> PooledContext<'_> {
        let mut ctx = match self.idle.pop() {
            Some(ctx) => {
                self.idle_count.fetch_sub(1, Ordering::AcqRel);
                ctx
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Box::new(RequestContext::new(self.services.clone()))
            }
        };
        ctx.reset(parts, remote_addr);
        PooledContext {
            ctx: Some(ctx),
            pool: self,
        }
    }

    /// Return a context; it is cleared before it becomes visible to other requests
    pub fn release(&self, mut ctx: Box<RequestContext>) {
        ctx.reset(empty_parts(), None);
        if self.idle_count.fetch_add(1, Ordering::AcqRel) >= self.max_idle {
            self.idle_count.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.idle.push(ctx);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            idle: self.idle_count.load(Ordering::Relaxed),
        }
    }
}

/// A context on loan from a [`ContextPool`]; returned on drop
pub struct PooledContext<'a> {
    ctx: Option<Box<RequestContext>>,
    pool: &'a ContextPool,
}

impl PooledContext<'_> {
    /// Return the context now instead of at end of scope
    pub fn release(mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}

impl Deref for PooledContext<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("pooled context used after release"),
        }
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut RequestContext {
        match &mut self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("pooled context used after release"),
        }
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
