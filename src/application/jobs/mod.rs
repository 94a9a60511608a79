mod context;
mod distribute;
mod grade;
mod queue;
mod refresh;
mod session_update;

pub use context::{JobWorkerContext, job_failed};
pub use distribute::{
    DistributeStudentJobPayload, enqueue_distribute_student_job, process_distribute_student_job,
};
pub use grade::{
    GradeSubmissionJobPayload, enqueue_grade_submission_job, process_grade_submission_job,
};
pub use queue::enqueue_job;
pub use refresh::{
    CacheRefreshContext, CacheRefreshJob, cache_refresh_schedule, process_cache_refresh_job,
};
pub use session_update::{
    PersistSessionUpdateJobPayload, enqueue_persist_session_update_job,
    process_persist_session_update_job,
};
