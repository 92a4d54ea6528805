use std::collections::{HashMap, VecDeque};

use jobforge_domain::JobId;

/// 单个租户的等待队列
#[derive(Debug, Default)]
struct TenantLane {
    virtual_time: f64,
    /// (提交序号, 任务ID, 服务成本)
    pending: VecDeque<(u64, JobId, f64)>,
}

/// 按租户虚拟时间做公平调度。
///
/// 出队时选择有待处理任务且虚拟时间最小的租户（相同时取队头序号更小者），
/// 租户内部FIFO；被服务租户的虚拟时间增加该任务的成本。
/// 虚拟时间只存在于内存，进程重启后归零。
///
/// 空闲租户的虚拟时间一旦不高于活跃租户的最小虚拟时间，其记录即被丢弃：
/// 重新入队时它本来就会从该下限开始。
#[derive(Debug, Default)]
pub(crate) struct FairShareState {
    lanes: HashMap<String, TenantLane>,
}

impl FairShareState {
    pub fn push(&mut self, tenant: &str, sequence: u64, job_id: JobId, cost: f64) {
        let reactivating = self
            .lanes
            .get(tenant)
            .map_or(true, |lane| lane.pending.is_empty());

        if reactivating {
            // 空闲租户不能攒下额度：从活跃租户的最小虚拟时间开始
            let floor = self
                .lanes
                .iter()
                .filter(|(name, lane)| name.as_str() != tenant && !lane.pending.is_empty())
                .map(|(_, lane)| lane.virtual_time)
                .reduce(f64::min);
            let lane = self.lanes.entry(tenant.to_string()).or_default();
            if let Some(floor) = floor {
                lane.virtual_time = lane.virtual_time.max(floor);
            }
        }

        self.lanes
            .entry(tenant.to_string())
            .or_default()
            .pending
            .push_back((sequence, job_id, cost));
    }

    pub fn pop(&mut self) -> Option<JobId> {
        let tenant = self
            .lanes
            .iter()
            .filter_map(|(name, lane)| {
                lane.pending
                    .front()
                    .map(|(sequence, _, _)| (name, lane.virtual_time, *sequence))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)))
            .map(|(name, _, _)| name.clone())?;

        let lane = self.lanes.get_mut(&tenant)?;
        let (_, job_id, cost) = lane.pending.pop_front()?;
        lane.virtual_time += cost;
        self.prune_idle();
        Some(job_id)
    }

    pub fn remove(&mut self, tenant: &str, job_id: JobId) -> bool {
        let Some(lane) = self.lanes.get_mut(tenant) else {
            return false;
        };
        match lane.pending.iter().position(|(_, id, _)| *id == job_id) {
            Some(index) => {
                lane.pending.remove(index);
                self.prune_idle();
                true
            }
            None => false,
        }
    }

    /// 没有活跃租户时不丢弃任何记录
    fn prune_idle(&mut self) {
        let floor = self
            .lanes
            .values()
            .filter(|lane| !lane.pending.is_empty())
            .map(|lane| lane.virtual_time)
            .reduce(f64::min);
        if let Some(floor) = floor {
            self.lanes
                .retain(|_, lane| !lane.pending.is_empty() || lane.virtual_time > floor);
        }
    }

    pub fn virtual_time(&self, tenant: &str) -> Option<f64> {
        self.lanes.get(tenant).map(|lane| lane.virtual_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_alternates_between_equal_tenants() {
        let mut state = FairShareState::default();
        let a: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        let b: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in a.iter().enumerate() {
            state.push("a", i as u64, *id, 1.0);
        }
        for (i, id) in b.iter().enumerate() {
            state.push("b", 10 + i as u64, *id, 1.0);
        }

        let order: Vec<JobId> = std::iter::from_fn(|| state.pop()).collect();
        assert_eq!(order, vec![a[0], b[0], a[1], b[1], a[2], b[2]]);
    }

    #[test]
    fn test_expensive_jobs_consume_more_share() {
        let mut state = FairShareState::default();
        let heavy = Uuid::new_v4();
        state.push("heavy", 0, heavy, 10.0);
        state.push("heavy", 1, Uuid::new_v4(), 10.0);
        let light: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in light.iter().enumerate() {
            state.push("light", 2 + i as u64, *id, 1.0);
        }

        assert_eq!(state.pop(), Some(heavy));
        assert_eq!(state.pop(), Some(light[0]));
        assert_eq!(state.pop(), Some(light[1]));
        assert_eq!(state.pop(), Some(light[2]));
        assert_eq!(state.virtual_time("heavy"), Some(10.0));
    }

    #[test]
    fn test_idle_tenant_cannot_bank_credit() {
        let mut state = FairShareState::default();
        for i in 0..5 {
            state.push("busy", i, Uuid::new_v4(), 1.0);
        }
        for _ in 0..3 {
            state.pop();
        }
        assert_eq!(state.virtual_time("busy"), Some(3.0));

        state.push("late", 100, Uuid::new_v4(), 1.0);
        assert_eq!(state.virtual_time("late"), Some(3.0));
    }

    #[test]
    fn test_remove() {
        let mut state = FairShareState::default();
        let id = Uuid::new_v4();
        state.push("a", 0, id, 1.0);
        assert!(state.remove("a", id));
        assert!(!state.remove("a", id));
        assert!(!state.remove("missing", id));
        assert_eq!(state.pop(), None);
    }

    #[test]
    fn test_departed_tenant_lane_is_dropped_once_caught_up() {
        let mut state = FairShareState::default();
        let gone = Uuid::new_v4();
        state.push("gone", 0, gone, 1.0);
        for i in 1..5 {
            state.push("busy", i, Uuid::new_v4(), 1.0);
        }

        assert_eq!(state.pop(), Some(gone));
        // 仍领先于活跃租户，保留
        assert_eq!(state.virtual_time("gone"), Some(1.0));

        state.pop();
        assert_eq!(state.virtual_time("gone"), None);
        assert_eq!(state.lanes.len(), 1);

        state.push("gone", 10, Uuid::new_v4(), 1.0);
        assert_eq!(state.virtual_time("gone"), Some(1.0));
    }

    #[test]
    fn test_remove_drops_emptied_lane() {
        let mut state = FairShareState::default();
        state.push("busy", 0, Uuid::new_v4(), 1.0);
        let id = Uuid::new_v4();
        state.push("short", 1, id, 1.0);

        assert!(state.remove("short", id));
        assert_eq!(state.virtual_time("short"), None);
        assert_eq!(state.virtual_time("busy"), Some(0.0));
    }
}
