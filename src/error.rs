/*
 * Kernel Error Codes
 *
 * Every error user mode can observe. Syscalls return these negated in rax;
 * kernel-internal code moves them around as Result<_, Error>.
 */

#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Environment does not exist, or the caller may not touch it
    BadEnv = 1,
    /// Malformed argument
    Invalid = 2,
    /// No physical memory available
    NoMem = 3,
    /// All NENV environments are in use
    NoFreeEnv = 4,
    /// IPC target is not waiting in ipc_recv
    IpcNotRecv = 5,
}

impl Error {
    /// The negative value handed back to user mode.
    pub fn code(self) -> i64 {
        -(self as i64)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadEnv => write!(f, "bad environment"),
            Error::Invalid => write!(f, "invalid parameter"),
            Error::NoMem => write!(f, "out of memory"),
            Error::NoFreeEnv => write!(f, "out of environments"),
            Error::IpcNotRecv => write!(f, "env is not recving"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            Error::BadEnv,
            Error::Invalid,
            Error::NoMem,
            Error::NoFreeEnv,
            Error::IpcNotRecv,
        ];
        for (i, e) in all.iter().enumerate() {
            assert!(e.code() < 0);
            for other in &all[i + 1..] {
                assert_ne!(e.code(), other.code());
            }
        }
    }
}
