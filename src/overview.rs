//! Headline counts for the instructor's overview tab.

use chrono::NaiveDate;
use log::warn;
use serde::Serialize;

use crate::attendance::date_key;
use crate::models::{ATTENDANCES, ROUTINES, RowId, SessionUser};
use crate::store::{Backend, Query, StoreError};
use crate::students::roster_query;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub students: usize,
    pub routines: usize,
    pub attendance_today: usize,
}

fn or_zero(what: &str, result: Result<usize, StoreError>) -> usize {
    result.unwrap_or_else(|e| {
        warn!("Could not count {what}: {e}");
        0
    })
}

/// Counts students, routines and today's check-ins in parallel. A failing
/// count shows as zero instead of failing the page.
pub async fn fetch_stats(backend: &dyn Backend, instructor: &SessionUser, today: NaiveDate) -> Stats {
    let gym = instructor.gym_id.as_ref().map(RowId::to_value);

    let students = roster_query(instructor);
    let routines = Query::table(ROUTINES).eq_opt("gym_id", gym.clone());
    let attendance = Query::table(ATTENDANCES)
        .gte("date", date_key(today))
        .eq_opt("gym_id", gym);

    let (students, routines, attendance) = futures::join!(
        backend.count(&students),
        backend.count(&routines),
        backend.count(&attendance),
    );

    Stats {
        students: or_zero("students", students),
        routines: or_zero("routines", routines),
        attendance_today: or_zero("attendance", attendance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, Role, USERS};
    use crate::store::LocalBackend;
    use serde_json::json;
    use tempfile::TempDir;

    fn coach(gym: Option<&str>) -> SessionUser {
        SessionUser {
            id: "coach".into(),
            name: "Coach".into(),
            username: "coach".into(),
            role: Role::INSTRUCTOR.into(),
            status: AccountStatus::Active,
            cuota_status: None,
            gym_id: gym.map(RowId::from),
        }
    }

    #[tokio::test]
    async fn counts_are_gym_scoped() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();

        for (username, gym) in [("a", "g1"), ("b", "g1"), ("c", "g2")] {
            backend
                .insert(USERS, json!({ "username": username, "role": "ALUMNO", "gym_id": gym }))
                .await
                .unwrap();
        }
        backend
            .insert(USERS, json!({ "username": "coach", "role": "PROFESOR", "gym_id": "g1" }))
            .await
            .unwrap();
        backend
            .insert(ROUTINES, json!({ "nombre": "Plan", "student_id": "a", "gym_id": "g1" }))
            .await
            .unwrap();
        for (student, date) in [("a", "2024-04-30"), ("a", "2024-05-01"), ("b", "2024-05-01")] {
            backend
                .insert(ATTENDANCES, json!({ "student_id": student, "date": date, "gym_id": "g1" }))
                .await
                .unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let stats = fetch_stats(&backend, &coach(Some("g1")), today).await;
        assert_eq!(stats, Stats { students: 2, routines: 1, attendance_today: 2 });

        let stats = fetch_stats(&backend, &coach(None), today).await;
        assert_eq!(stats.students, 3);
    }
}
