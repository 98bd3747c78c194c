//! End-to-end lifecycle tests driving the scheduler and a worker over the
//! in-memory store, queue and lock cache.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use datapack_core::{ExportLayout, InMemoryLockCache, JobId, RunId};
use datapack_flow::catalog::{ExportFormat, ProviderKind, StepKind, WorkUnitCatalog};
use datapack_flow::dispatch::memory::InMemoryStepQueue;
use datapack_flow::dispatch::{Envelope, Priority, StepQueue};
use datapack_flow::error::Error;
use datapack_flow::job::{BoundingBox, Job, LicenseGrants, ProviderExport};
use datapack_flow::notify::{InMemoryNotifier, NotificationVerb};
use datapack_flow::operation::{FailingOperation, FixtureOperation, OperationRegistry};
use datapack_flow::plan::PipelineFactory;
use datapack_flow::proc::ProcessKiller;
use datapack_flow::provider::ProviderTaskState;
use datapack_flow::run::RunState;
use datapack_flow::scheduler::Scheduler;
use datapack_flow::service::ExportService;
use datapack_flow::step::{FailureKind, FailureRecord, StepState};
use datapack_flow::store::memory::InMemoryStore;
use datapack_flow::store::Store;
use datapack_flow::worker::{Worker, WorkerTick};
use datapack_flow::finalize::RunFinalizer;

struct Rig {
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryStepQueue>,
    notifier: Arc<InMemoryNotifier>,
    service: ExportService,
    scheduler: Scheduler,
    worker: Worker,
    run_id: RunId,
    _dir: tempfile::TempDir,
}

fn two_provider_job() -> Job {
    Job {
        id: JobId::generate(),
        name: "Flood Extent".into(),
        owner: "gis-user".into(),
        event: Some("flood-2026".into()),
        extent: BoundingBox::new(5.0, 5.0, 10.0, 10.0).unwrap(),
        projections: vec![],
        provider_exports: vec![
            ProviderExport::new(
                ProviderKind::Osm,
                "osm",
                "OpenStreetMap",
                vec![ExportFormat::Gpkg],
            ),
            ProviderExport::new(
                ProviderKind::Wfs,
                "wfs-hydro",
                "Hydrography",
                vec![ExportFormat::Shp],
            ),
        ],
    }
}

/// Registry where every acquisition succeeds and shapefile conversion
/// fails (scenario: provider B's conversion step breaks).
fn registry_with_failing_shp() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register(
        StepKind::SelectionExport,
        Arc::new(FixtureOperation::new("selection.geojson", b"{}".to_vec())),
    );
    registry.register(
        StepKind::OsmCollection,
        Arc::new(FixtureOperation::new("osm.gpkg", b"gpkg bytes".to_vec())),
    );
    registry.register(
        StepKind::WfsQuery,
        Arc::new(FixtureOperation::new("hydro.gpkg", b"gpkg bytes".to_vec())),
    );
    registry.register(
        StepKind::ConvertShp,
        Arc::new(FailingOperation::new(FailureRecord::new(
            FailureKind::Operation,
            "ogr2ogr exited with status 1",
        ))),
    );
    registry
}

async fn rig(job: &Job, registry: OperationRegistry) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExportLayout::new(dir.path().join("stage"), dir.path().join("download"));
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryStepQueue::new("datapack.default"));
    let locks = Arc::new(InMemoryLockCache::new());
    let notifier = Arc::new(InMemoryNotifier::new());

    let factory = PipelineFactory::new(WorkUnitCatalog::new(), 14);
    let run_id = factory
        .create_run(store.as_ref(), job, &LicenseGrants::new(), "gis-user", None)
        .await
        .unwrap();
    let plan = factory
        .build_plan(store.as_ref(), job, run_id, Some("datapack.default"))
        .await
        .unwrap();

    let service = ExportService::new(
        store.clone(),
        queue.clone(),
        factory,
        layout.clone(),
        notifier.clone(),
    );
    let finalizer = RunFinalizer::new(layout.clone(), notifier.clone());
    let worker = Worker::new(
        "worker-1",
        store.clone(),
        queue.clone(),
        locks,
        Arc::new(registry),
        layout,
        finalizer,
    )
    .with_killer(ProcessKiller::new(Duration::from_millis(10)));

    Rig {
        store,
        queue,
        notifier,
        service,
        scheduler: Scheduler::new(plan),
        worker,
        run_id,
        _dir: dir,
    }
}

/// Drives scheduler ticks and worker polls until the run finalizes.
async fn drive(rig: &Rig) -> RunState {
    for _ in 0..50 {
        let tick = rig
            .scheduler
            .tick(rig.store.as_ref(), rig.queue.as_ref())
            .await
            .unwrap();

        for _ in 0..50 {
            match rig.worker.poll_once().await.unwrap() {
                WorkerTick::Idle => break,
                _ => {}
            }
        }

        if tick.complete {
            break;
        }
    }
    rig.store
        .get_run(&rig.run_id)
        .await
        .unwrap()
        .unwrap()
        .state
}

#[tokio::test]
async fn happy_path_run_completes_with_archive() {
    let mut job = two_provider_job();
    // Both providers succeed: convert the wfs provider to gpkg only.
    job.provider_exports[1].formats = vec![ExportFormat::Gpkg];

    let rig = rig(&job, registry_with_failing_shp()).await;
    let state = drive(&rig).await;
    assert_eq!(state, RunState::Completed);

    let run = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    for provider in run.data_provider_tasks() {
        assert_eq!(provider.state, ProviderTaskState::Completed);
    }

    // finished_at set exactly once and ordered after started_at.
    let started = run.started_at.expect("started");
    let finished = run.finished_at.expect("finished");
    assert!(finished >= started);

    // Default archive was produced and verified.
    let archives = rig.store.archives_for_run(&rig.run_id).await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(
        archives[0].state,
        datapack_flow::archive::ArchiveState::Success
    );

    // The user was told their DataPack is ready.
    assert!(rig
        .notifier
        .notifications()
        .iter()
        .any(|n| n.verb == NotificationVerb::RunCompleted));
}

#[tokio::test]
async fn partial_failure_settles_incomplete_and_subset_archive_works() {
    // Provider A (osm, gpkg) succeeds; provider B (wfs, shp) fails its
    // conversion step.
    let job = two_provider_job();
    let rig = rig(&job, registry_with_failing_shp()).await;

    let state = drive(&rig).await;
    assert_eq!(state, RunState::Incomplete);

    let run = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    let osm = run
        .data_provider_tasks()
        .find(|p| p.slug == "osm")
        .unwrap();
    let wfs = run
        .data_provider_tasks()
        .find(|p| p.slug == "wfs-hydro")
        .unwrap();
    assert_eq!(osm.state, ProviderTaskState::Completed);
    assert_eq!(wfs.state, ProviderTaskState::Incomplete);

    // The failed step carries its human-readable summary.
    let status = rig.service.get_run_status(rig.run_id).await.unwrap();
    let wfs_status = status
        .providers
        .iter()
        .find(|p| p.slug == "wfs-hydro")
        .unwrap();
    assert!(wfs_status
        .steps
        .iter()
        .any(|s| s.failure.as_deref() == Some("Operation: ogr2ogr exited with status 1")));

    // An archive over {A} succeeds and contains exactly A's files; the
    // manifest lists one data source.
    let archive_id = rig
        .service
        .create_archive(rig.run_id, &[osm.id])
        .await
        .unwrap();
    let archive = rig
        .store
        .get_archive(&archive_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archive.state, datapack_flow::archive::ArchiveState::Success);

    let path = archive.file_path.expect("archive written");
    let mut zip = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect();
    for name in names.iter().filter(|n| n.starts_with("data/")) {
        assert!(name.starts_with("data/osm/"), "foreign file {name}");
    }
    let mut manifest_json = String::new();
    zip.by_name("MANIFEST/manifest.json")
        .unwrap()
        .read_to_string(&mut manifest_json)
        .unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&manifest_json).unwrap();
    assert_eq!(manifest["sources"].as_array().unwrap().len(), 1);
    assert_eq!(manifest["sources"][0]["slug"], "osm");
}

#[tokio::test]
async fn duplicate_archive_coverage_is_rejected_once_archived() {
    let mut job = two_provider_job();
    job.provider_exports[1].formats = vec![ExportFormat::Gpkg];
    let rig = rig(&job, registry_with_failing_shp()).await;
    drive(&rig).await;

    let run = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    let osm_id = run
        .data_provider_tasks()
        .find(|p| p.slug == "osm")
        .unwrap()
        .id;

    rig.service
        .create_archive(rig.run_id, &[osm_id])
        .await
        .unwrap();
    let before = rig.store.archives_for_run(&rig.run_id).await.unwrap().len();

    let result = rig.service.create_archive(rig.run_id, &[osm_id]).await;
    assert!(matches!(result, Err(Error::DuplicateArchive { .. })));
    assert_eq!(
        rig.store.archives_for_run(&rig.run_id).await.unwrap().len(),
        before
    );
}

#[tokio::test]
async fn cancelling_a_running_step_aborts_the_chain() {
    // Single-provider job so the cancellation owns the whole outcome.
    let job = Job {
        provider_exports: vec![ProviderExport::new(
            ProviderKind::Osm,
            "osm",
            "OpenStreetMap",
            vec![ExportFormat::Gpkg, ExportFormat::Kml],
        )],
        ..two_provider_job()
    };
    let rig = rig(&job, registry_with_failing_shp()).await;

    // Dispatch and execute the selection step, then bring the acquisition
    // step to RUNNING under a (pretend) worker pid.
    rig.scheduler
        .tick(rig.store.as_ref(), rig.queue.as_ref())
        .await
        .unwrap();
    assert!(matches!(
        rig.worker.poll_once().await.unwrap(),
        WorkerTick::Executed(_)
    ));
    rig.scheduler
        .tick(rig.store.as_ref(), rig.queue.as_ref())
        .await
        .unwrap();

    let run = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    let provider = run.data_provider_tasks().next().unwrap();
    let provider_id = provider.id;
    let acquisition = provider
        .steps
        .iter()
        .find(|s| s.kind == StepKind::OsmCollection)
        .unwrap();
    let acquisition_id = acquisition.id;

    // Drain the dispatch for it and simulate the step running elsewhere.
    rig.queue.take().await.unwrap();
    rig.store
        .cas_step_state(
            &rig.run_id,
            &acquisition_id,
            StepState::Pending,
            StepState::Running,
        )
        .await
        .unwrap();
    rig.store
        .record_step_start(&rig.run_id, &acquisition_id, "worker-1", 4321)
        .await
        .unwrap();

    // Cancel: an interrupt is enqueued above every normal priority.
    rig.service
        .cancel_provider_task(provider_id, "gis-user")
        .await
        .unwrap();
    let entry = rig.queue.take().await.unwrap().expect("interrupt");
    assert!(entry.priority > Priority::Task.value());
    let Envelope::Interrupt(ref interrupt) = entry.envelope else {
        panic!("expected interrupt, got {:?}", entry.envelope);
    };
    assert_eq!(interrupt.pid, 4321);

    // Put it back and let the worker handle it.
    rig.queue
        .enqueue(entry.envelope.clone(), Default::default())
        .await
        .unwrap();
    assert!(matches!(
        rig.worker.poll_once().await.unwrap(),
        WorkerTick::Interrupted(_)
    ));

    let step = rig
        .store
        .get_step(&rig.run_id, &acquisition_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state, StepState::Cancelled);

    // Downstream conversion steps were never dispatched and are cancelled.
    let state = drive(&rig).await;
    assert_eq!(state, RunState::Cancelled);
    let run = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    let provider = run.get_provider_task(&provider_id).unwrap();
    for step in provider
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::ConvertKml)
    {
        assert_eq!(step.state, StepState::Cancelled);
        assert!(step.started_at.is_none(), "never executed");
    }
    assert_eq!(provider.state, ProviderTaskState::Cancelled);
}

#[tokio::test]
async fn finalize_is_idempotent_after_completion() {
    let mut job = two_provider_job();
    job.provider_exports[1].formats = vec![ExportFormat::Gpkg];
    let rig = rig(&job, registry_with_failing_shp()).await;
    drive(&rig).await;

    let before = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();

    // Crash-recovery re-finalization recomputes from persisted records and
    // changes nothing.
    let layout = ExportLayout::new(
        rig._dir.path().join("stage"),
        rig._dir.path().join("download"),
    );
    let finalizer = RunFinalizer::new(layout, rig.notifier.clone()).with_keep_stage(true);
    finalizer
        .finalize_run(rig.store.as_ref(), &rig.run_id)
        .await
        .unwrap();

    let after = rig.store.get_run(&rig.run_id).await.unwrap().unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.started_at, before.started_at);
    assert_eq!(after.finished_at, before.finished_at);
    assert_eq!(
        rig.store.archives_for_run(&rig.run_id).await.unwrap().len(),
        1
    );
}
