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

//! Resolves a configured user/group and drops root privileges before the
//! master worker enters its accept loop (spec §4.5). Grounded on the
//! `setuid`/`setgid` sequence BES's C++ server performs at startup.

use anyhow::{anyhow, bail, Context};
use nix::unistd::{self, Gid, Group, Uid, User};

/// A user or group reference as it appears in configuration: either a name
/// to look up, or a literal `#NNN` numeric id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Name(String),
    Id(u32),
}

impl Principal {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('#') {
            Some(digits) => match digits.parse::<u32>() {
                Ok(id) => Principal::Id(id),
                Err(_) => Principal::Name(raw.to_string()),
            },
            None => Principal::Name(raw.to_string()),
        }
    }

    fn resolve_uid(&self) -> anyhow::Result<(Uid, Gid)> {
        match self {
            Principal::Id(id) => {
                let uid = Uid::from_raw(*id);
                let user = User::from_uid(uid)
                    .context("looking up numeric uid")?
                    .ok_or_else(|| anyhow!("no passwd entry for uid {id}"))?;
                Ok((user.uid, user.gid))
            }
            Principal::Name(name) => {
                let user = User::from_name(name)
                    .context("looking up user by name")?
                    .ok_or_else(|| anyhow!("no such user {name:?}"))?;
                Ok((user.uid, user.gid))
            }
        }
    }

    fn resolve_gid(&self) -> anyhow::Result<Gid> {
        match self {
            Principal::Id(id) => Ok(Gid::from_raw(*id)),
            Principal::Name(name) => {
                let group = Group::from_name(name)
                    .context("looking up group by name")?
                    .ok_or_else(|| anyhow!("no such group {name:?}"))?;
                Ok(group.gid)
            }
        }
    }
}

/// Drops from uid 0 to the configured user (and, if given, group). Refuses
/// to continue as uid 0 after the drop, per spec §4.5's invariant.
pub fn drop_privileges(user: &Principal, group: Option<&Principal>) -> anyhow::Result<()> {
    if !unistd::geteuid().is_root() {
        return Ok(());
    }

    let (user_uid, user_gid) = user.resolve_uid()?;
    let target_gid = match group {
        Some(g) => g.resolve_gid()?,
        None => user_gid,
    };

    unistd::setgid(target_gid).context("setgid during privilege drop")?;
    unistd::setuid(user_uid).context("setuid during privilege drop")?;

    if unistd::geteuid().is_root() {
        bail!("privilege drop completed but effective uid is still 0");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_numeric_form() {
        assert_eq!(Principal::parse("#123"), Principal::Id(123));
    }

    #[test]
    fn parses_name_form() {
        assert_eq!(Principal::parse("bes"), Principal::Name("bes".to_string()));
    }

    #[test]
    fn malformed_numeric_form_falls_back_to_name() {
        assert_eq!(Principal::parse("#notanumber"), Principal::Name("#notanumber".to_string()));
    }
}
