//! 프로세스 전역 셸 풀.
//!
//! (인터프리터, 셸 종류) → 셸 인스턴스의 2단 맵을 조립 락 하나로
//! 보호한다. 인스턴스는 처음 요청될 때 만들어져 기동되고, 명시적
//! stop이나 전체 셧다운 때만 제거된다. 전체 셧다운은 되돌릴 수 없다 —
//! 종료 플래그가 켜진 뒤에는 어떤 셸도 만들거나 재시작할 수 없다.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::ShellConfig;
use crate::process::ProcessDescriptorFactory;
use crate::shell::error::ShellError;
use crate::shell::ShellInstance;

/// 인터프리터 설치본을 식별하는 불투명 키 (실행 파일/jar 경로)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterpreterId(String);

impl InterpreterId {
    pub fn new(executable_or_jar: impl Into<String>) -> Self {
        Self(executable_or_jar.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterpreterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 같은 인터프리터 아래에서 셸을 용도별로 구분하는 풀 슬롯
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Completion,
    Other,
}

/// restart_all 때 함께 비워야 하는 외부 캐시 (인터프리터 관리자의
/// 설정 캐시, 전역 모듈 캐시 등)
pub trait CacheInvalidator: Send + Sync {
    fn name(&self) -> &str;
    fn clear_cache(&self) -> anyhow::Result<()>;
}

struct RegistryInner {
    shells: HashMap<InterpreterId, HashMap<ShellKind, Arc<ShellInstance>>>,
    invalidators: Vec<Box<dyn CacheInvalidator>>,
}

pub struct ShellRegistry {
    inner: Mutex<RegistryInner>,
    /// 단방향 종료 스위치 — 레지스트리 락 아래에서만 켜지고,
    /// 인스턴스들은 락 없이 읽는다 (false→true 전이뿐이라 안전)
    finished: Arc<AtomicBool>,
    config: ShellConfig,
}

impl ShellRegistry {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                shells: HashMap::new(),
                invalidators: Vec::new(),
            }),
            finished: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Mutex 락 획득 헬퍼 — poison은 셸 오류로 변환
    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>, ShellError> {
        self.inner.lock().map_err(|e| {
            tracing::error!("shell registry lock poisoned: {}", e);
            ShellError::LockPoisoned
        })
    }

    /// restart_all 때 비울 외부 캐시를 등록한다.
    pub fn add_invalidator(&self, invalidator: Box<dyn CacheInvalidator>) {
        if let Ok(mut inner) = self.lock() {
            inner.invalidators.push(invalidator);
        }
    }

    /// 셸을 가져온다 — 없으면 팩토리로 만들어 기동한 뒤 풀에 넣는다.
    ///
    /// 기동 실패 시 인스턴스는 풀에 남지 않고 오류가 전파된다.
    pub fn get(
        &self,
        interpreter: &InterpreterId,
        kind: ShellKind,
        factory: &Arc<dyn ProcessDescriptorFactory>,
    ) -> Result<Arc<ShellInstance>, ShellError> {
        let mut inner = self.lock()?;
        if self.finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }

        let slot = inner.shells.entry(interpreter.clone()).or_default();
        if let Some(shell) = slot.get(&kind) {
            return Ok(shell.clone());
        }

        tracing::info!(
            "creating {:?} shell for interpreter '{}'",
            kind,
            interpreter
        );
        let shell = Arc::new(ShellInstance::new(
            interpreter.clone(),
            kind,
            factory.clone(),
            self.config.clone(),
            self.finished.clone(),
        )?);
        shell.start()?;
        slot.insert(kind, shell.clone());
        Ok(shell)
    }

    /// 외부에서 만든 인스턴스를 풀에 미리 넣는다 (주로 테스트/특수 구성용).
    pub fn register(
        &self,
        interpreter: &InterpreterId,
        kind: ShellKind,
        shell: Arc<ShellInstance>,
    ) -> Result<(), ShellError> {
        let mut inner = self.lock()?;
        if self.finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }
        inner
            .shells
            .entry(interpreter.clone())
            .or_default()
            .insert(kind, shell);
        Ok(())
    }

    /// 셸 하나를 끝내고 풀에서 제거한다. 끝내기 오류는 무시된다 —
    /// 어차피 제거할 것이므로.
    pub fn stop(&self, interpreter: &InterpreterId, kind: ShellKind) {
        let Ok(mut inner) = self.lock() else { return };
        if let Some(slot) = inner.shells.get_mut(interpreter) {
            if let Some(shell) = slot.remove(&kind) {
                shell.end();
                tracing::info!(
                    "stopped {:?} shell for interpreter '{}'",
                    kind,
                    interpreter
                );
            }
        }
    }

    /// 종료 플래그를 영구히 켜고, 모든 인스턴스를 강제 파괴하고, 풀을
    /// 비운다. 멱등.
    pub fn shutdown_all(&self) {
        let Ok(mut inner) = self.lock() else { return };
        tracing::info!("shutting down all completion shells (for good)");
        self.finished.store(true, Ordering::Relaxed);
        for slot in inner.shells.values() {
            for shell in slot.values() {
                shell.shutdown();
            }
        }
        inner.shells.clear();
    }

    /// 모든 인스턴스를 끝내고 등록된 외부 캐시를 전부 비운다.
    ///
    /// 첫 실패에서 중단하지 않는다 — 실패들을 모아 여러 줄 보고서로
    /// 돌려준다 (빈 문자열 = 전부 정상).
    pub fn restart_all(&self) -> String {
        let mut report = String::new();
        let Ok(inner) = self.lock() else {
            return "shell registry lock poisoned\n".to_string();
        };
        tracing::info!("restarting all completion shells and clearing caches");

        for slot in inner.shells.values() {
            for shell in slot.values() {
                shell.end();
            }
        }

        for invalidator in &inner.invalidators {
            if let Err(e) = invalidator.clear_cache() {
                tracing::error!("failed to clear cache '{}': {}", invalidator.name(), e);
                report.push_str(&format!("{}: {}\n", invalidator.name(), e));
            }
        }
        report
    }

    /// 종료 플래그가 켜졌는지
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// 현재 풀에 있는 인스턴스 수 (진단용)
    pub fn shell_count(&self) -> usize {
        match self.lock() {
            Ok(inner) => inner.shells.values().map(|slot| slot.len()).sum(),
            Err(_) => 0,
        }
    }
}

impl Default for ShellRegistry {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessDescriptor;
    use std::sync::atomic::AtomicUsize;

    struct NeverFactory;

    impl ProcessDescriptorFactory for NeverFactory {
        fn create(
            &self,
            _interpreter: &InterpreterId,
            _port: u16,
        ) -> anyhow::Result<ProcessDescriptor> {
            anyhow::bail!("factory should not be called in this test")
        }
    }

    struct CountingInvalidator {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CacheInvalidator for CountingInvalidator {
        fn name(&self) -> &str {
            "counting"
        }

        fn clear_cache(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cache is stuck")
            }
            Ok(())
        }
    }

    fn premade_shell(registry: &ShellRegistry, interpreter: &InterpreterId) -> Arc<ShellInstance> {
        Arc::new(
            ShellInstance::new(
                interpreter.clone(),
                ShellKind::Completion,
                Arc::new(NeverFactory),
                ShellConfig::default(),
                registry.finished.clone(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_register_and_get_returns_same_instance() {
        let registry = ShellRegistry::default();
        let interpreter = InterpreterId::new("/usr/bin/python3");
        let shell = premade_shell(&registry, &interpreter);
        registry
            .register(&interpreter, ShellKind::Completion, shell.clone())
            .unwrap();

        let factory: Arc<dyn ProcessDescriptorFactory> = Arc::new(NeverFactory);
        let fetched = registry
            .get(&interpreter, ShellKind::Completion, &factory)
            .unwrap();
        assert!(Arc::ptr_eq(&shell, &fetched));
        assert_eq!(registry.shell_count(), 1);
    }

    #[test]
    fn test_kinds_are_independent_slots() {
        let registry = ShellRegistry::default();
        let interpreter = InterpreterId::new("/usr/bin/python3");
        let completion = premade_shell(&registry, &interpreter);
        let other = premade_shell(&registry, &interpreter);
        registry
            .register(&interpreter, ShellKind::Completion, completion)
            .unwrap();
        registry
            .register(&interpreter, ShellKind::Other, other)
            .unwrap();
        assert_eq!(registry.shell_count(), 2);

        registry.stop(&interpreter, ShellKind::Completion);
        assert_eq!(registry.shell_count(), 1);
    }

    #[test]
    fn test_stop_unknown_shell_is_silent() {
        let registry = ShellRegistry::default();
        registry.stop(&InterpreterId::new("/ghost"), ShellKind::Completion);
        assert_eq!(registry.shell_count(), 0);
    }

    #[test]
    fn test_shutdown_all_empties_pool_and_forbids_everything() {
        let registry = ShellRegistry::default();
        let interpreter = InterpreterId::new("/usr/bin/python3");
        let shell = premade_shell(&registry, &interpreter);
        registry
            .register(&interpreter, ShellKind::Completion, shell)
            .unwrap();

        registry.shutdown_all();
        assert!(registry.is_finished());
        assert_eq!(registry.shell_count(), 0);

        // 이후의 모든 get/register는 Terminated
        let factory: Arc<dyn ProcessDescriptorFactory> = Arc::new(NeverFactory);
        assert!(matches!(
            registry.get(&interpreter, ShellKind::Completion, &factory),
            Err(ShellError::Terminated)
        ));
        let premade = ShellInstance::new(
            interpreter.clone(),
            ShellKind::Other,
            Arc::new(NeverFactory),
            ShellConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(matches!(
            registry.register(&interpreter, ShellKind::Other, Arc::new(premade)),
            Err(ShellError::Terminated)
        ));

        // 멱등
        registry.shutdown_all();
        assert!(registry.is_finished());
    }

    #[test]
    fn test_restart_all_runs_every_invalidator_and_accumulates_failures() {
        let registry = ShellRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add_invalidator(Box::new(CountingInvalidator {
            calls: calls.clone(),
            fail: false,
        }));
        registry.add_invalidator(Box::new(CountingInvalidator {
            calls: calls.clone(),
            fail: true,
        }));
        registry.add_invalidator(Box::new(CountingInvalidator {
            calls: calls.clone(),
            fail: false,
        }));

        let report = registry.restart_all();
        // 실패가 있어도 전부 실행됨
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(report.contains("cache is stuck"));
        assert_eq!(report.lines().count(), 1);
    }

    #[test]
    fn test_restart_all_clean_returns_empty_report() {
        let registry = ShellRegistry::default();
        assert_eq!(registry.restart_all(), "");
    }
}
