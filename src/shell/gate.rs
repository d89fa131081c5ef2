//! 셸 인스턴스 하나에 동시에 하나의 논리 작업만 허용하는 게이트.
//!
//! 공정성 보장도, 대기열도 없다 — 잡혀 있는 동안 25ms 단위의 유한
//! 대기를 반복하다가 풀리면 잡는다. 해제는 RAII 가드로 보장되어
//! 에러 경로에서도 반드시 일어난다.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct OperationGate {
    in_operation: Mutex<bool>,
    released: Condvar,
    poll: Duration,
}

/// 게이트 보유 증명 — drop 시 해제
pub struct OperationGuard<'a> {
    gate: &'a OperationGate,
}

impl OperationGate {
    pub fn new(poll: Duration) -> Self {
        Self {
            in_operation: Mutex::new(false),
            released: Condvar::new(),
            poll,
        }
    }

    /// 게이트가 풀릴 때까지 블로킹한 뒤 잡는다.
    pub fn acquire(&self) -> OperationGuard<'_> {
        // 플래그 하나뿐이라 poison 상태여도 값은 일관적이다
        let mut held = self
            .in_operation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while *held {
            let (guard, _timeout) = self
                .released
                .wait_timeout(held, self.poll)
                .unwrap_or_else(|e| e.into_inner());
            held = guard;
        }
        *held = true;
        OperationGuard { gate: self }
    }

    /// 현재 작업이 진행 중인지 (진단/테스트용)
    pub fn is_held(&self) -> bool {
        *self
            .in_operation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .gate
            .in_operation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *held = false;
        self.gate.released.notify_one();
    }
}
