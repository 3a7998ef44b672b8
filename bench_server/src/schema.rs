//! Diesel table definitions for the benchmark results store.
//!
//! Tables: manifest_reduced, manifests, results, environments, benchmarks,
//! test_jobs, result_data, scheduled_tasks.

diesel::table! {
    manifest_reduced (id) {
        id -> Int8,
        hash -> Varchar,
    }
}

diesel::table! {
    manifests (id) {
        id -> Int8,
        manifest -> Text,
        manifest_hash -> Varchar,
        reduced_id -> Nullable<Int8>,
    }
}

diesel::table! {
    results (id) {
        id -> Int8,
        name -> Varchar,
        build_id -> Int8,
        build_number -> Int8,
        build_url -> Varchar,
        branch_name -> Varchar,
        gerrit_change_number -> Nullable<Varchar>,
        gerrit_patchset_number -> Nullable<Varchar>,
        gerrit_change_id -> Nullable<Varchar>,
        gerrit_change_url -> Nullable<Varchar>,
        manifest_id -> Int8,
        annotation -> Nullable<Text>,
        completed -> Bool,
        reported -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    environments (id) {
        id -> Int8,
        identifier -> Varchar,
        name -> Varchar,
    }
}

diesel::table! {
    benchmarks (id) {
        id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    test_jobs (id) {
        id -> Varchar,
        result_id -> Int8,
        status -> Varchar,
        initialized -> Bool,
        completed -> Bool,
        resubmitted -> Bool,
        environment_id -> Nullable<Int8>,
        data -> Nullable<Bytea>,
        data_filetype -> Nullable<Varchar>,
        runner_kind -> Varchar,
        runner_url -> Varchar,
        url -> Nullable<Varchar>,
        definition -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    result_data (id) {
        id -> Int8,
        benchmark_id -> Int8,
        result_id -> Int8,
        test_job_id -> Nullable<Varchar>,
        name -> Varchar,
        measurements -> Array<Float8>,
        board -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    scheduled_tasks (id) {
        id -> Int8,
        kind -> Varchar,
        payload -> Jsonb,
        not_before -> Timestamptz,
        status -> Varchar,
        attempts -> Int4,
        locked_by -> Nullable<Varchar>,
        locked_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(manifests -> manifest_reduced (reduced_id));
diesel::joinable!(results -> manifests (manifest_id));
diesel::joinable!(test_jobs -> results (result_id));
diesel::joinable!(test_jobs -> environments (environment_id));
diesel::joinable!(result_data -> results (result_id));
diesel::joinable!(result_data -> benchmarks (benchmark_id));
diesel::joinable!(result_data -> test_jobs (test_job_id));

diesel::allow_tables_to_appear_in_same_query!(
    manifest_reduced,
    manifests,
    results,
    environments,
    benchmarks,
    test_jobs,
    result_data,
    scheduled_tasks,
);
