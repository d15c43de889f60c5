use std::collections::HashMap;
use std::fs;

/// Fields of `/proc/<pid>/stat` that follow the command name, starting with the state.
fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    // the command name may contain spaces and parentheses, fields resume after the last ')'
    Some(stat[stat.rfind(')')? + 1..].split_whitespace())
}

fn parse_ppid(stat: &str) -> Option<i32> {
    stat_fields(stat)?.nth(1)?.parse().ok()
}

fn parse_state(stat: &str) -> Option<char> {
    stat_fields(stat)?.next()?.chars().next()
}

/// Whether `pid` exists and has not exited. Zombies count as exited.
pub(crate) fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| parse_state(&stat))
        .is_some_and(|state| state != 'Z' && state != 'X')
}

/// Pids of every live descendant of `pid`. Processes that exit mid-walk are skipped.
pub(crate) fn descendants(pid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return vec![];
    };

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let Some(ppid) = fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| parse_ppid(&stat))
        else {
            continue;
        };
        children.entry(ppid).or_default().push(child);
    }

    let mut found = vec![];
    let mut queue = vec![pid];
    while let Some(parent) = queue.pop() {
        for &child in children.get(&parent).into_iter().flatten() {
            found.push(child);
            queue.push(child);
        }
    }
    found
}

/// `pid` followed by its descendants when `recurse` is set.
pub(crate) fn process_tree(pid: i32, recurse: bool) -> Vec<i32> {
    let mut pids = vec![pid];
    if recurse {
        pids.extend(descendants(pid));
    }
    pids
}
