// Copyright 2024 BES Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The master worker's exit code vocabulary, grounded on
//! `original_source/server/ServerExitConditions.h`. The supervisor decodes
//! a reaped child's exit status against this table to decide whether to
//! relaunch it.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    NormalShutdown = 0,
    FatalCanNotStart = 1,
    AbnormalTermination = 2,
    Restart = 3,
    ChildSubprocessNormalTermination = 4,
    ChildSubprocessAbnormalTermination = 5,
    ChildSubprocessReady = 6,
    UndefinedState = 7,
}

impl ExitCode {
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::NormalShutdown),
            1 => Some(ExitCode::FatalCanNotStart),
            2 => Some(ExitCode::AbnormalTermination),
            3 => Some(ExitCode::Restart),
            4 => Some(ExitCode::ChildSubprocessNormalTermination),
            5 => Some(ExitCode::ChildSubprocessAbnormalTermination),
            6 => Some(ExitCode::ChildSubprocessReady),
            7 => Some(ExitCode::UndefinedState),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether the supervisor should relaunch the master worker after
    /// seeing this exit code. Exit conditions 4 and 5 describe a
    /// subprocess of the master, not the master itself, and are ignored
    /// by the daemon per the original header's comments; they never reach
    /// this decision because the supervisor only decodes the master's own
    /// exit status.
    pub fn should_restart(self) -> bool {
        matches!(self, ExitCode::Restart)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_restart_requests_relaunch() {
        for code in [
            ExitCode::NormalShutdown,
            ExitCode::FatalCanNotStart,
            ExitCode::AbnormalTermination,
            ExitCode::ChildSubprocessNormalTermination,
            ExitCode::ChildSubprocessAbnormalTermination,
            ExitCode::ChildSubprocessReady,
            ExitCode::UndefinedState,
        ] {
            assert!(!code.should_restart());
        }
        assert!(ExitCode::Restart.should_restart());
    }

    #[test]
    fn from_raw_round_trips_known_codes() {
        for raw in 0..=7 {
            assert_eq!(ExitCode::from_raw(raw).unwrap().as_raw(), raw);
        }
    }

    #[test]
    fn from_raw_rejects_unknown_codes() {
        assert!(ExitCode::from_raw(42).is_none());
    }
}
