use std::fmt;
use tracing::Level;

#[derive(Debug, Clone, Copy)]
pub enum SandboxDomain {
    Platform,
    Isolate,
    Context,
    Execution,
    Callback,
    Memory,
    Config,
}

impl SandboxDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxDomain::Platform => "engine.platform",
            SandboxDomain::Isolate => "engine.isolate",
            SandboxDomain::Context => "engine.context",
            SandboxDomain::Execution => "sandbox.execution",
            SandboxDomain::Callback => "sandbox.callback",
            SandboxDomain::Memory => "sandbox.memory",
            SandboxDomain::Config => "runtime.config",
        }
    }
}

impl fmt::Display for SandboxDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security-relevant sandbox outcome, logged with a stable field set so
/// operators can alert on `sandbox = true`.
#[derive(Debug, Clone, Copy)]
pub struct SandboxEvent<'a> {
    pub level: Level,
    pub domain: SandboxDomain,
    pub kind: &'a str,
    pub isolate: Option<u64>,
    pub context: Option<u64>,
    pub execution: Option<u64>,
    pub message: &'a str,
}

impl<'a> SandboxEvent<'a> {
    pub fn new(level: Level, domain: SandboxDomain, kind: &'a str, message: &'a str) -> Self {
        Self { level, domain, kind, isolate: None, context: None, execution: None, message }
    }

    pub fn isolate(mut self, id: u64) -> Self {
        self.isolate = Some(id);
        self
    }

    pub fn context(mut self, id: u64) -> Self {
        self.context = Some(id);
        self
    }

    pub fn execution(mut self, id: u64) -> Self {
        self.execution = Some(id);
        self
    }

    pub fn emit(self) {
        match self.level {
            Level::TRACE => tracing::event!(
                Level::TRACE,
                sandbox = true,
                domain = %self.domain,
                kind = self.kind,
                isolate = self.isolate,
                context = self.context,
                execution = self.execution,
                "{message}",
                message = self.message
            ),
            Level::DEBUG => tracing::event!(
                Level::DEBUG,
                sandbox = true,
                domain = %self.domain,
                kind = self.kind,
                isolate = self.isolate,
                context = self.context,
                execution = self.execution,
                "{message}",
                message = self.message
            ),
            Level::INFO => tracing::event!(
                Level::INFO,
                sandbox = true,
                domain = %self.domain,
                kind = self.kind,
                isolate = self.isolate,
                context = self.context,
                execution = self.execution,
                "{message}",
                message = self.message
            ),
            Level::WARN => tracing::event!(
                Level::WARN,
                sandbox = true,
                domain = %self.domain,
                kind = self.kind,
                isolate = self.isolate,
                context = self.context,
                execution = self.execution,
                "{message}",
                message = self.message
            ),
            _ => tracing::event!(
                Level::ERROR,
                sandbox = true,
                domain = %self.domain,
                kind = self.kind,
                isolate = self.isolate,
                context = self.context,
                execution = self.execution,
                "{message}",
                message = self.message
            ),
        }
    }
}
