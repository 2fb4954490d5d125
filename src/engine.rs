use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::proxy::{Egress, PROXY_ENV_VARS};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// 子进程输出 (按行读取)
pub type OutputStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// 启动一个 worker 所需的全部信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub channel_id: String,
    pub program: String,
    pub args: Vec<String>,
    /// 注入的环境变量
    pub env: Vec<(String, String)>,
    /// 需要从继承环境中清除的变量
    pub env_remove: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// 已启动的 worker 进程
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// 取出输出流，只能取一次
    fn take_output(&mut self) -> Option<OutputStream>;

    /// 等待退出，必须可以安全地被取消后重新调用
    async fn wait(&mut self) -> io::Result<ExitInfo>;

    /// 发送优雅退出信号，不等待
    fn terminate(&mut self) -> io::Result<()>;

    /// 强制结束并回收
    async fn kill(&mut self) -> io::Result<()>;
}

/// 进程启动能力
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &WorkerCommand) -> io::Result<Box<dyn WorkerProcess>>;
}

/// 使用 tokio::process 启动真实子进程
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, command: &WorkerCommand) -> io::Result<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        for key in &command.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        // FFmpeg 的日志输出在 stderr，同时作为存活信号
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(BufReader::new(stderr)) as OutputStream)
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            match self.child.id() {
                Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
                // 已经被回收
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// 启动前检查系统内存
///
/// 无法获取内存信息时仅记录警告，不阻断流程。
pub fn check_memory(min_free_kb: u64) -> Result<()> {
    if min_free_kb == 0 {
        return Ok(());
    }
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < min_free_kb => Err(Error::InsufficientMemory {
            available_kb: mem.avail,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Failed to check memory usage: {}", e);
            Ok(())
        }
    }
}

/// 准备频道工作目录，已存在则清空重建
pub async fn prepare_output_dir(server: &ServerConfig, channel_id: &str) -> io::Result<Option<PathBuf>> {
    let Some(root) = &server.output_root else {
        return Ok(None);
    };
    let output_dir = Path::new(root).join(channel_id);
    if output_dir.exists() {
        let _ = fs::remove_dir_all(&output_dir).await;
    }
    fs::create_dir_all(&output_dir).await?;
    Ok(Some(output_dir))
}

/// 组装 FFmpeg 命令行与出口环境变量
pub fn build_launch(
    server: &ServerConfig,
    channel: &Channel,
    egress: &Egress,
    output_dir: Option<&Path>,
) -> WorkerCommand {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        channel.source.clone(),
    ];

    // 替换输出路径变量
    let dir_str = output_dir.map(|d| d.to_string_lossy().into_owned());
    for arg in &channel.output_args {
        let final_arg = match &dir_str {
            Some(dir) => arg.replace("{output_dir}", dir),
            None => arg.clone(),
        };
        args.push(final_arg);
    }

    let env: Vec<(String, String)> = egress
        .env_vars()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    // 直连时清除继承的代理变量，避免绕过出口配置
    let env_remove = if egress.is_direct() {
        PROXY_ENV_VARS.iter().map(|k| k.to_string()).collect()
    } else {
        Vec::new()
    };

    info!(
        "Prepared worker for channel [{}] via egress {}",
        channel.id, egress
    );

    WorkerCommand {
        channel_id: channel.id.clone(),
        program: server.ffmpeg_binary.clone(),
        args,
        env,
        env_remove,
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use super::{ExitInfo, WorkerCommand, OutputStream, ProcessLauncher, WorkerProcess};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::Instant;

    /// 模拟进程的行为
    #[derive(Debug, Clone, Copy)]
    pub enum Script {
        /// 输出一行后持续运行，直到被终止
        Run,
        /// 输出一行，`after` 之后以 `code` 退出
        Crash { after: Duration, code: i32 },
        /// 既不输出也不退出
        Silent,
        /// 忽略 SIGTERM，只能 kill
        Stubborn,
        /// 连 kill 都无法回收，例如卡在不可中断的 IO 上
        Hung,
    }

    #[derive(Default)]
    struct Counters {
        live: AtomicUsize,
        max_live: AtomicUsize,
        terminated: AtomicUsize,
        killed: AtomicUsize,
        next_pid: AtomicU32,
    }

    /// 按脚本队列依次产生进程，队列为空时使用默认脚本
    pub struct MockLauncher {
        default: Mutex<Script>,
        scripts: Mutex<VecDeque<Script>>,
        launches: Mutex<Vec<WorkerCommand>>,
        fail: AtomicBool,
        counters: Arc<Counters>,
    }

    impl MockLauncher {
        pub fn new(default: Script) -> Self {
            Self {
                default: Mutex::new(default),
                scripts: Mutex::new(VecDeque::new()),
                launches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
            }
        }

        pub fn push(&self, script: Script) {
            self.scripts.lock().push_back(script);
        }

        pub fn set_default(&self, script: Script) {
            *self.default.lock() = script;
        }

        pub fn fail_spawns(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn launches(&self) -> Vec<WorkerCommand> {
            self.launches.lock().clone()
        }

        /// 同时存活进程数的峰值
        pub fn max_live(&self) -> usize {
            self.counters.max_live.load(Ordering::SeqCst)
        }

        pub fn terminated(&self) -> usize {
            self.counters.terminated.load(Ordering::SeqCst)
        }

        pub fn killed(&self) -> usize {
            self.counters.killed.load(Ordering::SeqCst)
        }
    }

    impl ProcessLauncher for MockLauncher {
        fn launch(&self, command: &WorkerCommand) -> io::Result<Box<dyn WorkerProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg: not found"));
            }
            self.launches.lock().push(command.clone());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(*self.default.lock());

            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            let pid = 1000 + self.counters.next_pid.fetch_add(1, Ordering::SeqCst);
            let (exit, _) = watch::channel(None);

            Ok(Box::new(MockProcess {
                pid,
                script,
                spawned_at: Instant::now(),
                exit,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct MockProcess {
        pid: u32,
        script: Script,
        spawned_at: Instant,
        exit: watch::Sender<Option<ExitInfo>>,
        counters: Arc<Counters>,
    }

    impl Drop for MockProcess {
        fn drop(&mut self) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    const SIGNALLED: ExitInfo = ExitInfo {
        code: None,
        success: false,
    };

    #[async_trait]
    impl WorkerProcess for MockProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn take_output(&mut self) -> Option<OutputStream> {
            match self.script {
                Script::Silent => None,
                _ => Some(Box::new(io::Cursor::new(
                    b"Input #0, flv, from 'rtmp://src':\nframe=    1 fps=0.0 speed=1x\rframe=    2 fps=25 speed=1x\r"
                        .to_vec(),
                ))),
            }
        }

        async fn wait(&mut self) -> io::Result<ExitInfo> {
            let crash_at = match self.script {
                Script::Crash { after, code } => Some((self.spawned_at + after, code)),
                _ => None,
            };
            let mut rx = self.exit.subscribe();
            let signalled = async {
                loop {
                    if let Some(exit) = *rx.borrow_and_update() {
                        return exit;
                    }
                    if rx.changed().await.is_err() {
                        return SIGNALLED;
                    }
                }
            };
            let crash = async {
                match crash_at {
                    Some((at, code)) => {
                        tokio::time::sleep_until(at).await;
                        ExitInfo {
                            code: Some(code),
                            success: code == 0,
                        }
                    }
                    None => std::future::pending::<ExitInfo>().await,
                }
            };
            tokio::select! {
                exit = signalled => Ok(exit),
                exit = crash => Ok(exit),
            }
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
            if !matches!(self.script, Script::Stubborn | Script::Hung) {
                self.exit.send_replace(Some(SIGNALLED));
            }
            Ok(())
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.counters.killed.fetch_add(1, Ordering::SeqCst);
            if !matches!(self.script, Script::Hung) {
                self.exit.send_replace(Some(SIGNALLED));
            }
            Ok(())
        }
    }
}
