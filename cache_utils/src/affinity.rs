use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// List the processors the calling thread is currently allowed to run on.
pub fn available_cpus() -> Result<Vec<usize>, nix::Error> {
    let current = sched_getaffinity(Pid::from_raw(0))?;
    let mut cpus = Vec::new();
    for i in 0..CpuSet::count() {
        if current.is_set(i)? {
            cpus.push(i);
        }
    }
    Ok(cpus)
}

/// The `n`-th allowed processor, wrapping around when there are fewer than `n + 1` of them.
pub fn nth_available_cpu(n: usize) -> Result<usize, nix::Error> {
    let cpus = available_cpus()?;
    if cpus.is_empty() {
        return Err(nix::Error::ESRCH);
    }
    Ok(cpus[n % cpus.len()])
}

/// Pin the calling thread on `cpu`, returning the previous mask.
pub fn set_affinity(cpu: usize) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    let mut core = CpuSet::new();
    core.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &core)?;
    Ok(old)
}

pub fn restore_affinity(old: &CpuSet) -> Result<(), nix::Error> {
    sched_setaffinity(Pid::from_raw(0), old)
}
