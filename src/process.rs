//! 완성 서버 서브프로세스 기동/상태 조회 헬퍼.
//!
//! 어떤 커맨드라인과 환경으로 서버를 띄울지는 코어가 모른다 —
//! [`ProcessDescriptorFactory`]가 외부에서 주입되고, 코어는 디스크립터를
//! 받아 실행하고 생사만 관리한다.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use crate::registry::InterpreterId;

/// 서버 프로세스 하나를 띄우는 데 필요한 전부.
/// `launch_log`는 실패 진단 시 사용자에게 보여줄 사람이 읽는 기록.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub launch_log: String,
}

impl ProcessDescriptor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let launch_log = format!("{} {}", program, args.join(" "));
        Self {
            program,
            args,
            env: Vec::new(),
            working_dir: None,
            launch_log,
        }
    }
}

/// 인터프리터와 할당된 포트로부터 프로세스 디스크립터를 만드는 팩토리.
/// 셸 종류별/인터프리터 종류별 전략 객체로, 레지스트리 생성 시 주입된다.
pub trait ProcessDescriptorFactory: Send + Sync {
    fn create(
        &self,
        interpreter: &InterpreterId,
        port: u16,
    ) -> anyhow::Result<ProcessDescriptor>;
}

/// 논블로킹 생사 조회 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    Running,
    /// 종료 코드 (시그널로 죽었으면 None)
    Exited(Option<i32>),
    Unknown,
}

/// 디스크립터대로 서브프로세스를 띄운다. stdio는 전부 끊는다 —
/// 통신은 소켓으로만 하고, 파이프가 차서 서버가 멈추는 일을 막는다.
pub fn spawn(descriptor: &ProcessDescriptor) -> std::io::Result<Child> {
    let mut cmd = Command::new(&descriptor.program);
    cmd.args(&descriptor.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in &descriptor.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &descriptor.working_dir {
        cmd.current_dir(dir);
    }
    crate::utils::apply_creation_flags(&mut cmd);
    cmd.spawn()
}

/// 블로킹 없이 프로세스 생사를 확인한다.
pub fn probe(child: &mut Child) -> LivenessStatus {
    match child.try_wait() {
        Ok(Some(status)) => LivenessStatus::Exited(status.code()),
        Ok(None) => LivenessStatus::Running,
        Err(e) => {
            tracing::debug!("liveness probe failed: {}", e);
            LivenessStatus::Unknown
        }
    }
}
