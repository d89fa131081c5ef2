//! 서브프로세스 하나 + 소켓 하나의 소유와 기동/연결 핸드셰이크.
//!
//! 기동 절차: 임시 리스닝 소켓을 열고, 팩토리가 만든 디스크립터로
//! 서버 프로세스를 띄운 뒤, 서버가 우리 포트로 되돌아 연결할 때까지
//! 논블로킹 accept를 폴링한다. 서버 쪽 바인드백이 느릴 수 있으므로
//! 시도 횟수 × 시도당 시간 창의 이중 한도로 기다린다.

use std::io::Read;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::ShellConfig;
use crate::process::{self, LivenessStatus, ProcessDescriptorFactory};
use crate::protocol::BUFFER_SIZE;
use crate::registry::InterpreterId;
use crate::shell::error::ShellError;

/// 소켓 비우기에 허용하는 최대 시간
const DRAIN_BUDGET: Duration = Duration::from_secs(50);

/// 셸 인스턴스 하나의 프로세스/소켓 상태.
/// 인스턴스 뮤텍스 아래에서만 접근된다.
pub(crate) struct Supervisor {
    pub(crate) process: Option<Child>,
    pub(crate) stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    pub(crate) connected: bool,
    pub(crate) in_start: bool,
    pub(crate) in_read: bool,
    pub(crate) in_write: bool,
    pub(crate) in_restart: bool,
    /// 마지막 start에 쓰인 인터프리터 — restart가 기억해 둔다
    interpreter: Option<InterpreterId>,
    retry_delay: Duration,
    launch_log: String,
}

impl Supervisor {
    pub(crate) fn new() -> Self {
        Self {
            process: None,
            stream: None,
            listener: None,
            connected: false,
            in_start: false,
            in_read: false,
            in_write: false,
            in_restart: false,
            interpreter: None,
            retry_delay: Duration::from_millis(1000),
            launch_log: String::new(),
        }
    }

    /// 서버 프로세스를 만들고 소켓 연결까지 마친다.
    ///
    /// 이미 기동 중이거나 연결되어 있으면 아무것도 하지 않는다 —
    /// 두 번째 기동 요청이 핸드셰이크와 경합하지 않도록.
    pub(crate) fn start(
        &mut self,
        interpreter: &InterpreterId,
        retry_delay: Duration,
        factory: &dyn ProcessDescriptorFactory,
        config: &ShellConfig,
        finished: &AtomicBool,
    ) -> Result<(), ShellError> {
        self.retry_delay = retry_delay;
        self.interpreter = Some(interpreter.clone());

        if self.in_start || self.connected {
            return Ok(());
        }
        if finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }

        self.in_start = true;
        let result = self.start_inner(interpreter, factory, config, finished);
        self.in_start = false;

        match result {
            Ok(()) => {
                self.connected = true;
                tracing::info!(
                    "completion shell connected for interpreter '{}'",
                    interpreter
                );
                Ok(())
            }
            Err(e) => {
                self.kill_process();
                Err(e)
            }
        }
    }

    fn start_inner(
        &mut self,
        interpreter: &InterpreterId,
        factory: &dyn ProcessDescriptorFactory,
        config: &ShellConfig,
        finished: &AtomicBool,
    ) -> Result<(), ShellError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        if port == 0 {
            return Err(ShellError::Launch(
                "ephemeral listener reported port 0".to_string(),
            ));
        }

        // 이전 프로세스가 남아 있으면 먼저 정리 (idempotent)
        if self.process.is_some() {
            self.end();
        }
        self.listener = Some(listener);

        let descriptor = factory
            .create(interpreter, port)
            .map_err(|e| ShellError::Launch(e.to_string()))?;
        self.launch_log = descriptor.launch_log.clone();
        tracing::info!("launching completion server: {}", self.launch_log);

        let child = process::spawn(&descriptor)
            .map_err(|e| ShellError::Launch(format!("{} ({})", e, self.launch_log)))?;
        self.process = Some(child);

        // 워밍업 — 프로세스가 바로 죽는 경우를 연결 시도 전에 잡는다
        std::thread::sleep(config.warmup());
        if let Some(child) = self.process.as_mut() {
            if let LivenessStatus::Exited(code) = process::probe(child) {
                return Err(ShellError::Launch(format!(
                    "completion server exited before any connection attempt (exit code {:?}).\n{}",
                    code, self.launch_log
                )));
            }
        }

        std::thread::sleep(self.retry_delay);

        let mut attempt = 0u32;
        let mut accepted: Option<TcpStream> = None;
        while accepted.is_none()
            && attempt < config.connect_attempts
            && !finished.load(Ordering::Relaxed)
        {
            attempt += 1;
            let window_start = Instant::now();
            while accepted.is_none() && window_start.elapsed() < config.attempt_window() {
                let accept_result = match self.listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => break,
                };
                match accept_result {
                    Ok((stream, peer)) => {
                        tracing::debug!("completion server connected back from {}", peer);
                        stream.set_nonblocking(false)?;
                        stream.set_read_timeout(Some(config.read_timeout()))?;
                        accepted = Some(stream);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(config.accept_poll());
                    }
                    // 타임아웃은 이 시도의 창만 끝낸다
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(e) => {
                        tracing::debug!("accept failed: {}", e);
                        std::thread::sleep(config.accept_poll());
                    }
                }
            }

            if accepted.is_none() && attempt > 1 {
                // 첫 실패는 흔한 일이라 로그하지 않는다
                tracing::warn!(
                    "connection attempt {} of {} failed, retrying...",
                    attempt,
                    config.connect_attempts
                );
                std::thread::sleep(self.retry_delay);
            }
        }

        match accepted {
            Some(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            None => {
                if finished.load(Ordering::Relaxed) {
                    return Err(ShellError::Terminated);
                }
                let liveness = match self.process.as_mut() {
                    Some(child) => process::probe(child),
                    None => LivenessStatus::Unknown,
                };
                let reason = match liveness {
                    LivenessStatus::Exited(code) => format!(
                        "no accept after {} attempts; the server process is no longer alive (exit code {:?})",
                        attempt, code
                    ),
                    LivenessStatus::Running => {
                        self.kill_process();
                        format!(
                            "no accept after {} attempts; the server process was still alive (killed now) \
                             - most likely a firewall is blocking the connection",
                            attempt
                        )
                    }
                    LivenessStatus::Unknown => {
                        format!("no accept after {} attempts; server process state unknown", attempt)
                    }
                };
                self.close_sockets();
                Err(ShellError::Connect {
                    reason,
                    launch_log: self.launch_log.clone(),
                })
            }
        }
    }

    /// 소켓과 프로세스를 정리하고 idle로 돌아간다. 이미 idle이어도 안전.
    pub(crate) fn end(&mut self) {
        self.close_sockets();
        self.connected = false;
        self.kill_process();
    }

    /// 전체 셧다운용 강제 정리 — 프로토콜상 인사 없이 핸들을 버리고
    /// 프로세스를 죽인다.
    pub(crate) fn shutdown(&mut self) {
        self.stream = None;
        self.listener = None;
        self.connected = false;
        self.kill_process();
    }

    /// end 후 기억해 둔 인터프리터로 다시 start.
    /// 재진입 restart는 no-op이며, start 실패는 로그만 남긴다.
    pub(crate) fn restart(
        &mut self,
        factory: &dyn ProcessDescriptorFactory,
        config: &ShellConfig,
        finished: &AtomicBool,
    ) -> Result<(), ShellError> {
        if self.in_restart {
            return Ok(());
        }
        if finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }
        self.in_restart = true;
        self.end();
        let result = match self.interpreter.clone() {
            Some(interpreter) => {
                let retry_delay = self.retry_delay;
                self.start(&interpreter, retry_delay, factory, config, finished)
            }
            None => Err(ShellError::InvalidState(
                "restart requested before the shell was ever started".to_string(),
            )),
        };
        self.in_restart = false;
        if let Err(e) = result {
            tracing::error!("error restarting completion shell: {}", e);
        }
        Ok(())
    }

    /// 소켓에 남은 바이트를 (NUL 패딩 포함) 읽어서 버린다.
    /// 프로토콜이 어긋난 뒤 다음 요청이 남은 데이터를 읽지 않도록.
    pub(crate) fn drain_socket(&mut self) -> std::io::Result<()> {
        let deadline = Instant::now() + DRAIN_BUDGET;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; BUFFER_SIZE];
        while Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if buf[..n].iter().all(|&b| b == 0) {
                        return Ok(());
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 쓰기가 가능한 상태인지 — 아니라면 즉시 상태 오류
    pub(crate) fn check_can_write(&self, finished: &AtomicBool) -> Result<(), ShellError> {
        self.check_phase(finished, "write")
    }

    /// 읽기가 가능한 상태인지 — 아니라면 즉시 상태 오류
    pub(crate) fn check_can_read(&self, finished: &AtomicBool) -> Result<(), ShellError> {
        self.check_phase(finished, "read")
    }

    fn check_phase(&self, finished: &AtomicBool, action: &str) -> Result<(), ShellError> {
        if finished.load(Ordering::Relaxed) {
            return Err(ShellError::Terminated);
        }
        if self.in_start {
            return Err(ShellError::InvalidState(format!(
                "the shell is still starting; cannot {} yet",
                action
            )));
        }
        if !self.connected {
            return Err(ShellError::InvalidState(format!(
                "the shell is not connected; cannot {}",
                action
            )));
        }
        if self.in_read {
            return Err(ShellError::InvalidState(format!(
                "the shell is already in read mode; cannot {} now",
                action
            )));
        }
        if self.in_write {
            return Err(ShellError::InvalidState(format!(
                "the shell is already in write mode; cannot {} now",
                action
            )));
        }
        Ok(())
    }

    fn close_sockets(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::debug!("socket close failed: {}", e);
            }
        }
        // 리스너는 drop으로 닫힌다
        self.listener = None;
    }

    fn kill_process(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("kill failed (process probably already gone): {}", e);
            }
            if let Err(e) = child.wait() {
                tracing::debug!("failed to reap completion server: {}", e);
            }
        }
    }
}
