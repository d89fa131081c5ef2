//! 완성 셸 인스턴스 — 호출자가 상대하는 단위.
//!
//! 인스턴스 하나 = 감독되는 서브프로세스 하나 + 소켓 하나 + 작업 게이트.
//! 공개 작업(import 완성, 검색 경로 변경, 정의 검색)은 전부 블로킹이며
//! 게이트로 직렬화된다. 요청 도중의 I/O 실패는 호출자에게 전파되지
//! 않는다 — 빈 결과를 돌려주고 인스턴스 스스로 재시작을 시도한다.

pub mod error;
pub mod gate;
pub(crate) mod supervisor;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ShellConfig;
use crate::process::ProcessDescriptorFactory;
use crate::protocol::codec;
use crate::protocol::{Completions, Definition, ProgressSink, ProtocolError};
use crate::registry::{InterpreterId, ShellKind};

use error::ShellError;
use gate::OperationGate;
use supervisor::Supervisor;

/// 로그에 남길 때 페이로드를 자르는 길이 — 거대한 응답으로 로그가
/// 터지는 것을 막는다
const LOG_PAYLOAD_LIMIT: usize = 500;

pub struct ShellInstance {
    interpreter: InterpreterId,
    kind: ShellKind,
    factory: Arc<dyn ProcessDescriptorFactory>,
    config: ShellConfig,
    /// 레지스트리와 공유하는 프로세스 전역 종료 플래그 (false→true 단방향)
    finished: Arc<AtomicBool>,
    state: Mutex<Supervisor>,
    gate: OperationGate,
}

impl ShellInstance {
    /// 인스턴스를 만든다. 프로세스는 아직 띄우지 않는다 — [`start`]가 따로.
    ///
    /// [`start`]: ShellInstance::start
    pub fn new(
        interpreter: InterpreterId,
        kind: ShellKind,
        factory: Arc<dyn ProcessDescriptorFactory>,
        config: ShellConfig,
        finished: Arc<AtomicBool>,
    ) -> Result<Self, ShellError> {
        if finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }
        let gate_poll = config.gate_poll();
        Ok(Self {
            interpreter,
            kind,
            factory,
            config,
            finished,
            state: Mutex::new(Supervisor::new()),
            gate: OperationGate::new(gate_poll),
        })
    }

    pub fn interpreter(&self) -> &InterpreterId {
        &self.interpreter
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    /// Mutex 락 획득 헬퍼 — poison은 셸 오류로 변환
    fn state(&self) -> Result<MutexGuard<'_, Supervisor>, ShellError> {
        self.state.lock().map_err(|e| {
            tracing::error!("shell state lock poisoned: {}", e);
            ShellError::LockPoisoned
        })
    }

    // ── 수명 주기 ────────────────────────────────────────────

    /// 서버 프로세스 기동 + 연결 핸드셰이크. 이미 연결되어 있으면 no-op.
    pub fn start(&self) -> Result<(), ShellError> {
        let mut state = self.state()?;
        state.start(
            &self.interpreter,
            self.config.retry_delay(),
            self.factory.as_ref(),
            &self.config,
            &self.finished,
        )
    }

    /// 소켓과 프로세스를 정리한다. 나중에 다시 start할 수 있다.
    pub fn end(&self) {
        match self.state() {
            Ok(mut state) => state.end(),
            Err(e) => tracing::error!("end skipped: {}", e),
        }
    }

    /// 전체 셧다운용 강제 정리 — 프로토콜 인사 없이 죽인다.
    pub fn shutdown(&self) {
        match self.state() {
            Ok(mut state) => state.shutdown(),
            Err(e) => tracing::error!("shutdown skipped: {}", e),
        }
    }

    /// end 후 같은 인터프리터로 재기동. 재진입 호출은 no-op.
    pub fn restart(&self) -> Result<(), ShellError> {
        let mut state = self.state()?;
        state.restart(self.factory.as_ref(), &self.config, &self.finished)
    }

    pub fn is_connected(&self) -> bool {
        self.state().map(|s| s.connected).unwrap_or(false)
    }

    // ── 공개 작업 (게이트로 직렬화) ─────────────────────────

    /// 주어진 접두사에 대한 import 완성을 가져온다.
    ///
    /// 먼저 검색 경로를 서버에 동기화한 뒤 완성을 요청한다. 요청 도중
    /// 실패하면 빈 결과가 돌아오고 셸은 조용히 재시작을 시도한다.
    pub fn get_import_completions(
        &self,
        prefix: &str,
        pythonpath: &[String],
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Completions, ShellError> {
        let _op = self.gate.acquire();
        self.change_pythonpath_locked(pythonpath)?;
        Ok(self.request_completions(&codec::encode_import_completions(prefix), progress))
    }

    /// 서버의 모듈 검색 경로를 교체한다.
    pub fn change_python_path(&self, pythonpath: &[String]) -> Result<(), ShellError> {
        let _op = self.gate.acquire();
        self.change_pythonpath_locked(pythonpath)
    }

    /// `module.token`의 정의 위치를 찾는다.
    ///
    /// 결과가 없거나 서버 응답의 위치 정보가 해석되지 않으면 `None`.
    pub fn get_definition(
        &self,
        module: &str,
        token: &str,
        pythonpath: &[String],
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Option<Definition>, ShellError> {
        let _op = self.gate.acquire();
        self.change_pythonpath_locked(pythonpath)?;

        let qualified = format!("{}.{}", module, token);
        let completions =
            self.request_completions(&codec::encode_search(&qualified), progress);

        let Some(record) = completions.records.first() else {
            return Ok(None);
        };
        // 검색 응답의 첫 레코드는 (line, col, found_as) 순서로 재해석된다
        let (Ok(line), Ok(col)) = (record.token.parse::<u32>(), record.description.parse::<u32>())
        else {
            tracing::warn!(
                "definition response had unparsable position: {:?}",
                record
            );
            return Ok(None);
        };
        Ok(Some(Definition {
            file: completions.file,
            found_as: record.args.clone(),
            line,
            col,
        }))
    }

    // ── 내부 요청/응답 ──────────────────────────────────────

    /// 게이트를 이미 잡은 상태에서 검색 경로 변경 요청을 보낸다.
    fn change_pythonpath_locked(&self, pythonpath: &[String]) -> Result<(), ShellError> {
        if self.finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }
        let _ = self.request_completions(&codec::encode_change_pythonpath(pythonpath), None);
        Ok(())
    }

    /// 요청 하나를 보내고 응답을 파싱한다. 어떤 실패든 여기서 흡수된다:
    /// 로그를 남기고, 인스턴스를 재시작하고, 빈 결과를 돌려준다.
    fn request_completions(
        &self,
        request: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Completions {
        match self.try_request(request, progress) {
            Ok(completions) => completions,
            Err(e) => {
                tracing::error!("completion request failed: {} (restarting shell)", e);
                if let Err(restart_err) = self.restart() {
                    tracing::error!("shell restart failed: {}", restart_err);
                }
                Completions::invalid()
            }
        }
    }

    fn try_request(
        &self,
        request: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Completions, ShellError> {
        self.write(request)?;
        let payload = self.read(progress)?;
        Ok(codec::parse_completions(&payload))
    }

    /// 요청 바이트를 소켓에 쓴다. 읽기/쓰기 단계가 겹치면 즉시 상태 오류.
    pub fn write(&self, request: &str) -> Result<(), ShellError> {
        let mut state = self.state()?;
        state.check_can_write(&self.finished)?;

        state.in_write = true;
        let result = match state.stream.as_mut() {
            Some(stream) => stream
                .write_all(request.as_bytes())
                .and_then(|_| stream.flush()),
            // connected인데 stream이 없는 경우는 불변식 위반
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connected shell has no socket",
            )),
        };
        state.in_write = false;
        result?;
        Ok(())
    }

    /// 종료 마커가 나올 때까지 응답을 읽어 페이로드를 돌려준다.
    ///
    /// 종료 마커가 끝내 오지 않으면 (프로토콜 오류) 로그를 남기고 빈
    /// 페이로드를 돌려준다 — 호출자에게는 "결과 없음"이 유효한 결과다.
    pub fn read(&self, progress: Option<&dyn ProgressSink>) -> Result<String, ShellError> {
        let mut state = self.state()?;
        state.check_can_read(&self.finished)?;

        state.in_read = true;
        let result = match state.stream.as_mut() {
            Some(stream) => codec::read_payload(
                stream,
                progress,
                self.config.idle_ceiling,
                self.config.idle_poll(),
            ),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connected shell has no socket",
            ))),
        };
        state.in_read = false;

        match result {
            Ok(payload) => Ok(payload),
            Err(ProtocolError::MissingTerminator { mut payload }) => {
                if payload.len() > LOG_PAYLOAD_LIMIT {
                    payload.truncate(LOG_PAYLOAD_LIMIT);
                    payload.push_str("...(continued)...");
                }
                tracing::error!(
                    "response missing terminal marker; discarding payload: {}",
                    payload
                );
                if let Err(e) = state.drain_socket() {
                    tracing::debug!("socket drain failed: {}", e);
                }
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessDescriptor;

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

    fn instance(finished: bool) -> ShellInstance {
        ShellInstance::new(
            InterpreterId::new("/usr/bin/python3"),
            ShellKind::Completion,
            Arc::new(NeverFactory),
            ShellConfig::default(),
            Arc::new(AtomicBool::new(finished)),
        )
        .unwrap()
    }

    #[test]
    fn test_new_after_shutdown_is_terminated() {
        let result = ShellInstance::new(
            InterpreterId::new("/usr/bin/python3"),
            ShellKind::Completion,
            Arc::new(NeverFactory),
            ShellConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );
        assert!(matches!(result, Err(ShellError::Terminated)));
    }

    #[test]
    fn test_write_before_connect_is_invalid_state() {
        let shell = instance(false);
        let err = shell.write("@@IMPORTS:x\nEND@@").unwrap_err();
        assert!(matches!(err, ShellError::InvalidState(_)));
    }

    #[test]
    fn test_read_before_connect_is_invalid_state() {
        let shell = instance(false);
        let err = shell.read(None).unwrap_err();
        assert!(matches!(err, ShellError::InvalidState(_)));
    }

    #[test]
    fn test_operations_after_shutdown_are_terminated() {
        let shell = instance(false);
        shell.finished.store(true, Ordering::Relaxed);
        assert!(matches!(
            shell.write("x").unwrap_err(),
            ShellError::Terminated
        ));
        assert!(matches!(shell.read(None).unwrap_err(), ShellError::Terminated));
        assert!(matches!(
            shell.change_python_path(&[]).unwrap_err(),
            ShellError::Terminated
        ));
        assert!(matches!(shell.restart().unwrap_err(), ShellError::Terminated));
    }

    #[test]
    fn test_failed_request_returns_invalid_completions() {
        // 연결된 적 없는 셸에 대한 요청 → 재시작 시도 후 빈 결과
        let shell = instance(false);
        let completions = shell.request_completions("@@IMPORTS:x\nEND@@", None);
        assert!(completions.is_empty());
        assert!(completions.file.is_none());
    }

    #[test]
    fn test_accessors() {
        let shell = instance(false);
        assert_eq!(shell.interpreter().as_str(), "/usr/bin/python3");
        assert_eq!(shell.kind(), ShellKind::Completion);
        assert!(!shell.is_connected());
    }
}
