//! IdGenerator port - ID 生成の抽象化
//!
//! IdGenerator は分散システムで使える ID を生成するためのインターフェースです。
//! テスト容易性のために、trait として抽象化しています。

use ulid::Ulid;

use crate::domain::ids::{ExecutionId, TaskRunId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// `Send + Sync` を要求（複数 partition から共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_execution_id(&self) -> ExecutionId;

    fn generate_task_run_id(&self) -> TaskRunId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// ManualClock を使えば timestamp 部分は決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.next_ulid())
    }

    fn generate_task_run_id(&self) -> TaskRunId {
        TaskRunId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_run_id();
        let id2 = id_gen.generate_task_run_id();
        let id3 = id_gen.generate_task_run_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_uses_clock_for_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.generate_execution_id();
        let id2 = id_gen.generate_execution_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // ただし、timestamp 部分は同じはず
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }
}
