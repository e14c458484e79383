use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationRequest {
    pub id: u64,
    pub target: usize,
    /// The target was more than one chunk away when the request started.
    pub long_jump: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollBehavior {
    Smooth,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScrollCommand {
    pub page: usize,
    pub offset: f32,
    pub behavior: ScrollBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStep {
    /// Scroll to this intermediate page, then continue.
    Chunk(usize),
    /// Within one chunk of the target.
    Arrive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NavigationOutcome {
    Arrived { page: usize, chunk_steps: usize },
    /// A newer request took over before this one finished.
    Superseded,
    /// Target out of range or no document ready; safe to retry later.
    NotFound,
}

/// Plans jumps and tracks which request is the active one. Last request
/// wins; nothing is queued.
#[derive(Debug)]
pub struct NavigationController {
    chunk_size: usize,
    chunk_yield: Duration,
    active: AtomicU64,
}

impl NavigationController {
    pub fn new(chunk_size: usize, chunk_yield: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_yield,
            active: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn begin(&self, target: usize, current: usize) -> NavigationRequest {
        let id = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        NavigationRequest {
            id,
            target,
            long_jump: target.abs_diff(current) > self.chunk_size,
        }
    }

    pub fn is_active(&self, request: &NavigationRequest) -> bool {
        self.active.load(Ordering::SeqCst) == request.id
    }

    /// Abandons whatever request is in flight.
    pub fn cancel(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn plan(&self, current: usize, target: usize) -> NavigationStep {
        let distance = target.abs_diff(current);
        if distance <= self.chunk_size {
            return NavigationStep::Arrive;
        }
        if target > current {
            NavigationStep::Chunk(current + self.chunk_size)
        } else {
            NavigationStep::Chunk(current - self.chunk_size)
        }
    }

    /// Gives the host a turn between chunk steps.
    pub async fn pause(&self) {
        if self.chunk_yield.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.chunk_yield).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(controller: &NavigationController, mut current: usize, target: usize) -> Vec<usize> {
        let mut visited = Vec::new();
        while let NavigationStep::Chunk(next) = controller.plan(current, target) {
            visited.push(next);
            current = next;
        }
        visited
    }

    #[test]
    fn short_jumps_arrive_directly() {
        let controller = NavigationController::new(50, Duration::ZERO);
        assert_eq!(controller.plan(1, 51), NavigationStep::Arrive);
        assert_eq!(controller.plan(80, 30), NavigationStep::Arrive);
    }

    #[test]
    fn long_jumps_are_bounded() {
        let controller = NavigationController::new(50, Duration::ZERO);
        let forward = steps(&controller, 1, 500);
        assert!(forward.len() <= 10);
        assert_eq!(forward.first(), Some(&51));
        assert_eq!(forward.last(), Some(&451));

        let backward = steps(&controller, 500, 1);
        assert_eq!(backward.first(), Some(&450));
        assert!(backward.iter().all(|page| *page >= 1));
        assert!(backward.len() <= 10);
    }

    #[test]
    fn newer_request_supersedes_older() {
        let controller = NavigationController::new(50, Duration::ZERO);
        let first = controller.begin(10, 1);
        assert!(controller.is_active(&first));
        assert!(!first.long_jump);

        let second = controller.begin(200, 1);
        assert!(second.long_jump);
        assert!(!controller.is_active(&first));
        assert!(controller.is_active(&second));

        controller.cancel();
        assert!(!controller.is_active(&second));
    }
}
