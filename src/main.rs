use std::path::PathBuf;
use std::sync::Arc;

use pyshell_core::config::ShellConfig;
use pyshell_core::process::{ProcessDescriptor, ProcessDescriptorFactory};
use pyshell_core::protocol::ProgressSink;
use pyshell_core::registry::{InterpreterId, ShellKind, ShellRegistry};

/// `<interpreter> <server-script> <port>`로 완성 서버를 띄우는 기본 팩토리
struct ScriptFactory {
    server_script: PathBuf,
}

impl ProcessDescriptorFactory for ScriptFactory {
    fn create(
        &self,
        interpreter: &InterpreterId,
        port: u16,
    ) -> anyhow::Result<ProcessDescriptor> {
        if !self.server_script.exists() {
            anyhow::bail!(
                "completion server script not found: {}",
                self.server_script.display()
            );
        }
        Ok(ProcessDescriptor::new(
            interpreter.as_str(),
            vec![
                self.server_script.to_string_lossy().into_owned(),
                port.to_string(),
            ],
        ))
    }
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn worked(&self, description: &str) {
        eprintln!("{}", description);
    }
}

/// 진단용 CLI: 인터프리터 하나로 셸을 띄워 import 완성 한 번을 질의한다.
///
/// 사용법: `pyshell-core <interpreter-executable> <prefix> [pythonpath...]`
/// 서버 스크립트 경로는 `PYSHELL_SERVER_SCRIPT` 환경 변수로 지정.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(interpreter_path) = args.next() else {
        anyhow::bail!("usage: pyshell-core <interpreter-executable> <prefix> [pythonpath...]");
    };
    let prefix = args.next().unwrap_or_default();
    let pythonpath: Vec<String> = args.collect();

    let server_script = std::env::var("PYSHELL_SERVER_SCRIPT")
        .map(PathBuf::from)
        .map_err(|_| anyhow::anyhow!("PYSHELL_SERVER_SCRIPT must point to the server script"))?;

    let registry = ShellRegistry::new(ShellConfig::load()?);
    let factory: Arc<dyn ProcessDescriptorFactory> = Arc::new(ScriptFactory { server_script });
    let interpreter = InterpreterId::new(interpreter_path);

    tracing::info!("starting completion shell for '{}'", interpreter);
    let result = (|| -> anyhow::Result<()> {
        let shell = registry.get(&interpreter, ShellKind::Completion, &factory)?;
        let completions =
            shell.get_import_completions(&prefix, &pythonpath, Some(&StderrProgress))?;

        match &completions.file {
            Some(file) => println!("module: {}", file),
            None => println!("module: <none>"),
        }
        for record in &completions.records {
            println!(
                "{}\t{}\t{}\t{}",
                record.token, record.typ, record.args, record.description
            );
        }
        tracing::info!("{} completions", completions.records.len());
        Ok(())
    })();

    registry.shutdown_all();
    result
}
