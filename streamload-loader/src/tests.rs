use crate::*;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use streamload_base::hashing::{HashMap, HashSet};

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[derive(Clone, Default)]
struct FakePackage {
    imports: Vec<ImportEntry>,
    exports: Vec<ExportEntry>,
    // How many times the handle reports InProgress before it is loaded
    handle_ticks: usize,
    // How many precache calls report the data as not resident yet
    unready_precaches: usize,
    // How many polls report resource allocations as still pending
    pending_allocation_polls: usize,
    allocation_cancels: Arc<AtomicUsize>,
}

impl FakePackage {
    fn with_exports(classes: &[&str]) -> Self {
        let exports = classes
            .iter()
            .enumerate()
            .map(|(i, class)| {
                ExportEntry::new(format!("Export{}", i), *class, i as u64 * 16, 16)
            })
            .collect();
        FakePackage {
            exports,
            ..Default::default()
        }
    }

    fn importing(
        mut self,
        package: &str,
    ) -> Self {
        let outer = self.imports.len();
        self.imports.push(ImportEntry::package(package));
        self.imports
            .push(ImportEntry::object(outer, "Thing", "Thing"));
        self
    }

    fn handle_ticks(
        mut self,
        handle_ticks: usize,
    ) -> Self {
        self.handle_ticks = handle_ticks;
        self
    }

    fn unready_precaches(
        mut self,
        unready_precaches: usize,
    ) -> Self {
        self.unready_precaches = unready_precaches;
        self
    }

    fn pending_allocation_polls(
        mut self,
        pending_allocation_polls: usize,
    ) -> Self {
        self.pending_allocation_polls = pending_allocation_polls;
        self
    }
}

struct FakeHandle {
    name: String,
    package: FakePackage,
    ticks_left: usize,
    unready_precaches_left: usize,
    pending_allocation_polls_left: Cell<usize>,
}

impl PackageHandle for FakeHandle {
    fn tick(
        &mut self,
        _time_limit: Option<Duration>,
    ) -> HandleStatus {
        if self.ticks_left > 0 {
            self.ticks_left -= 1;
            HandleStatus::InProgress
        } else {
            HandleStatus::Loaded
        }
    }

    fn imports(&self) -> &[ImportEntry] {
        &self.package.imports
    }

    fn exports(&self) -> &[ExportEntry] {
        &self.package.exports
    }

    fn precache(
        &mut self,
        _offset: u64,
        _size: u64,
    ) -> bool {
        if self.unready_precaches_left > 0 {
            self.unready_precaches_left -= 1;
            false
        } else {
            true
        }
    }

    fn has_pending_resource_allocations(&self) -> bool {
        let polls_left = self.pending_allocation_polls_left.get();
        if polls_left > 0 {
            self.pending_allocation_polls_left.set(polls_left - 1);
            true
        } else {
            false
        }
    }

    fn cancel_resource_allocations(&mut self) {
        self.pending_allocation_polls_left.set(0);
        self.package
            .allocation_cancels
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct FakeSource {
    packages: HashMap<String, FakePackage>,
    opened: Mutex<Vec<String>>,
}

impl FakeSource {
    fn new(packages: Vec<(&str, FakePackage)>) -> Self {
        FakeSource {
            packages: packages
                .into_iter()
                .map(|(name, package)| (name.to_string(), package))
                .collect(),
            opened: Default::default(),
        }
    }

    fn open_count(
        &self,
        name: &str,
    ) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|x| *x == name)
            .count()
    }
}

impl PackageSource for FakeSource {
    fn open_package(
        &self,
        request: &OpenPackageRequest,
    ) -> Result<Box<dyn PackageHandle>, OpenPackageError> {
        self.opened
            .lock()
            .unwrap()
            .push(request.name.as_str().to_string());
        let package = self
            .packages
            .get(request.name.as_str())
            .ok_or(OpenPackageError::FileNotFound)?;
        Ok(Box::new(FakeHandle {
            name: request.name.as_str().to_string(),
            package: package.clone(),
            ticks_left: package.handle_ticks,
            unready_precaches_left: package.unready_precaches,
            pending_allocation_polls_left: Cell::new(package.pending_allocation_polls),
        }))
    }
}

#[derive(Default)]
struct ObjectState {
    next_handle: u64,
    // Object -> (package, class)
    owners: HashMap<ObjectHandle, (String, String)>,
    package_objects: HashMap<String, ObjectHandle>,
    loaded_packages: Vec<String>,
    preloaded: HashSet<ObjectHandle>,
    post_loaded: Vec<(ObjectHandle, ThreadId)>,
    invalidated: Vec<ObjectHandle>,
    flags_cleared: HashSet<ObjectHandle>,
}

impl ObjectState {
    fn allocate(
        &mut self,
        package: &str,
        class: &str,
    ) -> ObjectHandle {
        self.next_handle += 1;
        let object = ObjectHandle(self.next_handle);
        self.owners
            .insert(object, (package.to_string(), class.to_string()));
        object
    }

    fn objects_of_class(
        &self,
        class: &str,
    ) -> Vec<ObjectHandle> {
        self.owners
            .iter()
            .filter(|(_, (_, object_class))| object_class == class)
            .map(|(object, _)| *object)
            .collect()
    }

    fn post_load_thread(
        &self,
        object: ObjectHandle,
    ) -> Option<ThreadId> {
        self.post_loaded
            .iter()
            .find(|(x, _)| *x == object)
            .map(|(_, thread)| *thread)
    }
}

#[derive(Default)]
struct FakeObjects {
    state: Mutex<ObjectState>,
    slow_export: Option<Duration>,
}

impl ObjectSystem for FakeObjects {
    fn is_package_loaded(
        &self,
        name: &PackageName,
    ) -> bool {
        self.state
            .lock()
            .unwrap()
            .loaded_packages
            .iter()
            .any(|x| x == name.as_str())
    }

    fn create_package(
        &self,
        name: &PackageName,
    ) -> ObjectHandle {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.package_objects.get(name.as_str()) {
            return *object;
        }
        let object = state.allocate(name.as_str(), PACKAGE_CLASS_NAME);
        state
            .package_objects
            .insert(name.as_str().to_string(), object);
        object
    }

    fn create_import(
        &self,
        _handle: &mut dyn PackageHandle,
        _import_index: usize,
    ) -> Option<ObjectHandle> {
        None
    }

    fn create_export(
        &self,
        handle: &mut dyn PackageHandle,
        export_index: usize,
        _objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, DeserializeError> {
        let class = handle.exports()[export_index].class_name.clone();
        if class == "Broken" {
            return Err(DeserializeError::new("export is corrupt"));
        }
        if let Some(slow_export) = self.slow_export {
            std::thread::sleep(slow_export);
        }

        let package = handle
            .downcast_ref::<FakeHandle>()
            .map(|fake_handle| fake_handle.name.clone())
            .ok_or_else(|| DeserializeError::new("not a fake handle"))?;
        Ok(Some(self.state.lock().unwrap().allocate(&package, &class)))
    }

    fn preload(
        &self,
        _handle: &mut dyn PackageHandle,
        object: ObjectHandle,
        _objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<(), DeserializeError> {
        self.state.lock().unwrap().preloaded.insert(object);
        Ok(())
    }

    fn post_load(
        &self,
        object: ObjectHandle,
        objects_loaded: &mut Vec<ObjectHandle>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .post_loaded
            .push((object, std::thread::current().id()));

        let owner = state.owners.get(&object).cloned();
        if let Some((package, class)) = owner {
            if class == "Spawner" {
                let spawned = state.allocate(&package, "Spawned");
                objects_loaded.push(spawned);
            }
        }
    }

    fn is_main_thread_only(
        &self,
        object: ObjectHandle,
    ) -> bool {
        self.state
            .lock()
            .unwrap()
            .owners
            .get(&object)
            .map_or(false, |(_, class)| class == "Texture")
    }

    fn outermost_package(
        &self,
        object: ObjectHandle,
    ) -> Option<PackageName> {
        self.state
            .lock()
            .unwrap()
            .owners
            .get(&object)
            .map(|(package, _)| PackageName::new(package))
    }

    fn clear_loading_flags(
        &self,
        objects: &[ObjectHandle],
    ) {
        self.state
            .lock()
            .unwrap()
            .flags_cleared
            .extend(objects.iter().copied());
    }

    fn invalidate(
        &self,
        objects: &[ObjectHandle],
    ) {
        self.state
            .lock()
            .unwrap()
            .invalidated
            .extend_from_slice(objects);
    }

    fn mark_package_loaded(
        &self,
        package_object: ObjectHandle,
        _load_time: Duration,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some((package, _)) = state.owners.get(&package_object).cloned() {
            state.loaded_packages.push(package);
        }
    }
}

struct FakeIndex(Vec<(&'static str, Vec<&'static str>)>);

impl DependencyIndex for FakeIndex {
    fn hard_dependencies(
        &self,
        name: &PackageName,
    ) -> Vec<PackageName> {
        self.0
            .iter()
            .find(|(package, _)| *package == name.as_str())
            .map(|(_, dependencies)| dependencies.iter().map(|x| PackageName::new(x)).collect())
            .unwrap_or_default()
    }
}

// Long enough that nothing in these tests hits it, limits only kick in when a step gives up
// its time slice
const GENEROUS_TIME_LIMIT: Duration = Duration::from_secs(10);

type Completions = Arc<Mutex<Vec<(String, Option<ObjectHandle>, LoadResult)>>>;

fn recorder(
    completions: &Completions,
) -> impl FnOnce(&PackageName, Option<ObjectHandle>, LoadResult) + Send + 'static {
    let completions = completions.clone();
    move |name, package_object, result| {
        completions
            .lock()
            .unwrap()
            .push((name.as_str().to_string(), package_object, result))
    }
}

struct Fixture {
    loader: AsyncLoader,
    source: Arc<FakeSource>,
    objects: Arc<FakeObjects>,
    completions: Completions,
}

impl Fixture {
    fn new(
        config: LoaderConfig,
        packages: Vec<(&str, FakePackage)>,
    ) -> Self {
        Self::with_objects(config, packages, FakeObjects::default(), None)
    }

    fn with_objects(
        config: LoaderConfig,
        packages: Vec<(&str, FakePackage)>,
        objects: FakeObjects,
        dependency_index: Option<Arc<dyn DependencyIndex>>,
    ) -> Self {
        init_logging();
        let source = Arc::new(FakeSource::new(packages));
        let objects = Arc::new(objects);
        let loader = match dependency_index {
            Some(dependency_index) => AsyncLoader::new_with_dependency_index(
                config,
                source.clone(),
                objects.clone(),
                dependency_index,
            ),
            None => AsyncLoader::new(config, source.clone(), objects.clone()),
        }
        .unwrap();

        Fixture {
            loader,
            source,
            objects,
            completions: Default::default(),
        }
    }

    fn enqueue(
        &self,
        name: &str,
        priority: LoadPriority,
    ) -> RequestId {
        self.loader.enqueue(
            PackageRequest::new(name)
                .priority(priority)
                .on_complete(recorder(&self.completions)),
        )
    }

    fn completions(&self) -> Vec<(String, Option<ObjectHandle>, LoadResult)> {
        self.completions.lock().unwrap().clone()
    }

    fn completed_names(&self) -> Vec<String> {
        self.completions()
            .into_iter()
            .map(|(name, _, _)| name)
            .collect()
    }

    fn step_of(
        &self,
        name: &str,
    ) -> Option<LoadStep> {
        let tracker = self.loader.shared.tracker.lock().unwrap();
        tracker
            .find(&PackageName::new(name))
            .and_then(|id| tracker.get(id))
            .and_then(|record| record.state.as_ref())
            .map(|state| state.step())
    }

    fn active_names(&self) -> Vec<(String, LoadPriority)> {
        self.loader
            .active_packages()
            .into_iter()
            .map(|(name, priority)| (name.as_str().to_string(), priority))
            .collect()
    }

    fn package_object(
        &self,
        name: &str,
    ) -> Option<ObjectHandle> {
        self.objects
            .state
            .lock()
            .unwrap()
            .package_objects
            .get(name)
            .copied()
    }

    fn loaded_packages(&self) -> Vec<String> {
        self.objects.state.lock().unwrap().loaded_packages.clone()
    }
}

#[test]
fn load_single_package() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::with_exports(&["Mesh", "Material"]))],
    );

    let request_id = fixture.enqueue("/Game/A", 0);
    assert_eq!(request_id, RequestId(1));
    assert!(fixture.loader.is_loading());
    assert_eq!(fixture.loader.queued_count(), 1);

    fixture.loader.flush(Some(request_id));

    let package_object = fixture.package_object("/Game/A");
    assert!(package_object.is_some());
    assert_eq!(
        fixture.completions(),
        vec![("/Game/A".to_string(), package_object, LoadResult::Succeeded)]
    );
    assert!(!fixture.loader.is_loading());
    assert_eq!(fixture.loaded_packages(), vec!["/Game/A".to_string()]);
    assert_eq!(fixture.loader.keep_alive_count(), 0);
    assert_eq!(fixture.loader.pending_finalize_count(), 0);
    assert_eq!(
        fixture.loader.load_percentage(&PackageName::new("/Game/A")),
        -1.0
    );

    let state = fixture.objects.state.lock().unwrap();
    for class in ["Mesh", "Material"] {
        let objects = state.objects_of_class(class);
        assert_eq!(objects.len(), 1);
        assert!(state.preloaded.contains(&objects[0]));
        assert!(state.post_load_thread(objects[0]).is_some());
        assert!(state.flags_cleared.contains(&objects[0]));
    }
    assert!(state.invalidated.is_empty());
}

#[test]
fn request_ids_increase() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::default())],
    );
    assert_eq!(fixture.enqueue("/Game/A", 0), RequestId(1));
    assert_eq!(fixture.enqueue("/Game/A", 0), RequestId(2));
    fixture.loader.flush(None);
    assert_eq!(fixture.completions().len(), 2);

    // Unknown and finished requests don't block
    fixture.loader.flush(Some(RequestId(1)));
    fixture.loader.flush(Some(RequestId(999)));
}

#[test]
fn missing_package_fails_and_is_remembered() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![(
            "/Game/A",
            FakePackage::with_exports(&["Mesh"]).importing("/Game/Missing"),
        )],
    );

    fixture.enqueue("/Game/Missing", 0);
    fixture.loader.flush(None);
    assert_eq!(
        fixture.completions(),
        vec![("/Game/Missing".to_string(), None, LoadResult::Failed)]
    );

    // The import is skipped instead of trying the file again
    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(fixture.completions()[1].2, LoadResult::Succeeded);
    assert_eq!(fixture.source.open_count("/Game/Missing"), 1);
    assert!(!fixture.loader.is_loading());
}

#[test]
fn missing_import_does_not_block_importer() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![(
            "/Game/A",
            FakePackage::with_exports(&["Mesh"]).importing("/Game/Missing"),
        )],
    );

    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(
        fixture.completions(),
        vec![(
            "/Game/A".to_string(),
            fixture.package_object("/Game/A"),
            LoadResult::Succeeded
        )]
    );
    assert_eq!(fixture.source.open_count("/Game/Missing"), 1);
}

#[test]
fn duplicate_enqueue_shares_package_and_raises_priority() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![
            ("/Game/A", FakePackage::default().handle_ticks(1)),
            ("/Game/B", FakePackage::default().handle_ticks(1)),
        ],
    );

    fixture.enqueue("/Game/B", 3);
    fixture.enqueue("/Game/A", 0);
    fixture.enqueue("/Game/A", 5);

    // Both handles give up their time slice, nothing finishes
    fixture.loader.tick(Some(GENEROUS_TIME_LIMIT));
    assert_eq!(
        fixture.active_names(),
        vec![("/Game/A".to_string(), 5), ("/Game/B".to_string(), 3)]
    );

    fixture.loader.flush(None);
    let mut names = fixture.completed_names();
    names.sort();
    assert_eq!(names, vec!["/Game/A", "/Game/A", "/Game/B"]);
    assert_eq!(fixture.source.open_count("/Game/A"), 1);
}

#[test]
fn importer_waits_for_dependency_handle() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![
            (
                "/Game/A",
                FakePackage::with_exports(&["Mesh"]).importing("/Game/B"),
            ),
            ("/Game/B", FakePackage::default().handle_ticks(3)),
        ],
    );

    fixture.enqueue("/Game/A", 0);
    for _ in 0..3 {
        assert_eq!(
            fixture.loader.tick(Some(GENEROUS_TIME_LIMIT)),
            TickResult::TimedOut
        );
        assert_eq!(fixture.step_of("/Game/A"), Some(LoadStep::LoadImports));
        assert_eq!(fixture.step_of("/Game/B"), Some(LoadStep::FinishHandle));
    }

    // Both imports walked, nothing else: 2 / (1 export + 2 imports + 2 estimated postloads)
    assert_eq!(
        fixture.loader.load_percentage(&PackageName::new("/Game/A")),
        40.0
    );
    assert_eq!(
        fixture.loader.load_percentage(&PackageName::new("/Game/B")),
        0.0
    );
    assert_eq!(
        fixture.loader.load_percentage(&PackageName::new("/Game/Unknown")),
        -1.0
    );

    fixture.loader.flush(None);
    assert_eq!(fixture.completed_names(), vec!["/Game/A"]);
    // Dependencies finalize first
    assert_eq!(
        fixture.loaded_packages(),
        vec!["/Game/B".to_string(), "/Game/A".to_string()]
    );
}

#[test]
fn dependency_takes_importer_priority() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![
            (
                "/Game/A",
                FakePackage::with_exports(&["Mesh"]).importing("/Game/B"),
            ),
            ("/Game/B", FakePackage::default().handle_ticks(3)),
        ],
    );

    fixture.enqueue("/Game/A", 7);
    fixture.loader.tick(Some(GENEROUS_TIME_LIMIT));
    let b_priority = fixture
        .active_names()
        .into_iter()
        .find(|(name, _)| name == "/Game/B")
        .map(|(_, priority)| priority);
    assert_eq!(b_priority, Some(7));

    fixture.loader.flush(None);
    assert_eq!(fixture.completed_names(), vec!["/Game/A"]);
}

#[test]
fn finalize_is_fifo_and_blocked_by_referenced_package() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![
            (
                "/Game/P",
                FakePackage::with_exports(&["Mesh"]).importing("/Game/D"),
            ),
            ("/Game/D", FakePackage::with_exports(&["Mesh"])),
            ("/Game/Q", FakePackage::with_exports(&["Mesh"])),
        ],
    );

    fixture.enqueue("/Game/P", 10);
    fixture.enqueue("/Game/D", 5);
    fixture.enqueue("/Game/Q", 1);

    // P waits on D. D and Q finish loading, but D is still referenced by P so Q can't be
    // finalized ahead of it.
    fixture.loader.tick(None);
    assert!(fixture.completions().is_empty());
    assert_eq!(fixture.loader.pending_finalize_count(), 2);
    assert_eq!(fixture.active_names(), vec![("/Game/P".to_string(), 10)]);

    fixture.loader.tick(None);
    assert_eq!(
        fixture.completed_names(),
        vec!["/Game/D", "/Game/Q", "/Game/P"]
    );
    assert!(!fixture.loader.is_loading());
}

#[test]
fn hard_dependencies_start_with_their_root() {
    let mut config = LoaderConfig::single_threaded();
    config.preload_dependencies = true;
    let index = FakeIndex(vec![
        ("/Game/Level", vec!["/Game/Props"]),
        ("/Game/Props", vec!["/Game/Core"]),
    ]);
    let fixture = Fixture::with_objects(
        config,
        vec![
            ("/Game/Level", FakePackage::default().handle_ticks(1)),
            ("/Game/Props", FakePackage::default().handle_ticks(1)),
            ("/Game/Core", FakePackage::default().handle_ticks(1)),
        ],
        FakeObjects::default(),
        Some(Arc::new(index)),
    );

    fixture.enqueue("/Game/Level", 7);
    fixture.loader.tick(Some(GENEROUS_TIME_LIMIT));
    assert_eq!(
        fixture.active_names(),
        vec![
            ("/Game/Core".to_string(), 7),
            ("/Game/Props".to_string(), 7),
            ("/Game/Level".to_string(), 7),
        ]
    );

    fixture.loader.flush(None);
    assert_eq!(fixture.completed_names(), vec!["/Game/Level"]);
    let mut loaded = fixture.loaded_packages();
    loaded.sort();
    assert_eq!(loaded, vec!["/Game/Core", "/Game/Level", "/Game/Props"]);
}

#[test]
fn deserialize_failure_fails_package() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::with_exports(&["Mesh", "Broken"]))],
    );

    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(
        fixture.completions(),
        vec![("/Game/A".to_string(), None, LoadResult::Failed)]
    );
    assert!(fixture.loaded_packages().is_empty());
    assert_eq!(fixture.loader.keep_alive_count(), 0);

    let state = fixture.objects.state.lock().unwrap();
    let mesh = state.objects_of_class("Mesh")[0];
    assert!(state.invalidated.contains(&mesh));
}

#[test]
fn objects_created_in_post_load_are_preloaded() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::with_exports(&["Spawner"]))],
    );

    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);

    let state = fixture.objects.state.lock().unwrap();
    let spawned = state.objects_of_class("Spawned");
    assert_eq!(spawned.len(), 1);
    assert!(state.preloaded.contains(&spawned[0]));
    assert!(state.post_load_thread(spawned[0]).is_some());
}

#[test]
fn objects_finished_callback_runs_before_completion() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::with_exports(&["Mesh"]))],
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let objects_finished_order = order.clone();
    let complete_order = order.clone();
    fixture.loader.enqueue(
        PackageRequest::new("/Game/A")
            .on_complete(move |_, _, result| {
                complete_order.lock().unwrap().push(("complete", result))
            })
            .on_objects_finished(move |_, _, result| {
                objects_finished_order
                    .lock()
                    .unwrap()
                    .push(("objects_finished", result))
            }),
    );
    fixture.loader.flush(None);

    assert_eq!(
        *order.lock().unwrap(),
        vec![
            ("objects_finished", LoadResult::Succeeded),
            ("complete", LoadResult::Succeeded)
        ]
    );
}

#[test]
fn tick_respects_time_limit() {
    let objects = FakeObjects {
        slow_export: Some(Duration::from_millis(2)),
        ..Default::default()
    };
    let fixture = Fixture::with_objects(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::with_exports(&["Mesh"; 20]))],
        objects,
        None,
    );

    fixture.enqueue("/Game/A", 0);
    let time_limit = Duration::from_millis(5);
    let start = Instant::now();
    let result = fixture.loader.tick(Some(time_limit));
    let elapsed = start.elapsed();

    assert_eq!(result, TickResult::TimedOut);
    // One export may run over
    assert!(elapsed < time_limit + Duration::from_millis(25));
    assert_ne!(fixture.step_of("/Game/A"), Some(LoadStep::Done));
    assert!(fixture.completions().is_empty());

    fixture.loader.flush(None);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);
}

#[test]
fn unready_export_gives_up_time_slice() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![(
            "/Game/A",
            FakePackage::with_exports(&["Mesh", "Mesh"]).unready_precaches(2),
        )],
    );

    fixture.enqueue("/Game/A", 0);
    for _ in 0..2 {
        assert_eq!(
            fixture.loader.tick(Some(GENEROUS_TIME_LIMIT)),
            TickResult::TimedOut
        );
        assert_eq!(fixture.step_of("/Game/A"), Some(LoadStep::CreateExports));
        assert!(fixture.completions().is_empty());
    }

    assert_eq!(
        fixture.loader.tick(Some(GENEROUS_TIME_LIMIT)),
        TickResult::Complete
    );
    assert_eq!(fixture.completed_names(), vec!["/Game/A".to_string()]);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);
}

#[test]
fn full_time_limit_waits_for_reads() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![(
            "/Game/A",
            FakePackage::with_exports(&["Mesh", "Mesh"]).unready_precaches(5),
        )],
    );

    fixture.enqueue("/Game/A", 0);
    assert_eq!(
        fixture.loader.tick_full_time_limit(GENEROUS_TIME_LIMIT),
        TickResult::Complete
    );
    assert_eq!(fixture.completions().len(), 1);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);
}

#[test]
fn pending_resource_allocations_wait_for_next_tick() {
    let package = FakePackage::with_exports(&["Texture"]).pending_allocation_polls(2);
    let allocation_cancels = package.allocation_cancels.clone();
    let fixture = Fixture::new(LoaderConfig::single_threaded(), vec![("/Game/A", package)]);

    fixture.enqueue("/Game/A", 0);
    for _ in 0..2 {
        assert_eq!(
            fixture.loader.tick(Some(GENEROUS_TIME_LIMIT)),
            TickResult::TimedOut
        );
        assert_eq!(
            fixture.step_of("/Game/A"),
            Some(LoadStep::FinishTextureAllocations)
        );
    }

    assert_eq!(
        fixture.loader.tick(Some(GENEROUS_TIME_LIMIT)),
        TickResult::Complete
    );
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);
    assert_eq!(allocation_cancels.load(Ordering::Relaxed), 0);
}

#[test]
fn flush_cancels_pending_resource_allocations() {
    let package = FakePackage::with_exports(&["Texture"]).pending_allocation_polls(100);
    let allocation_cancels = package.allocation_cancels.clone();
    let fixture = Fixture::new(LoaderConfig::single_threaded(), vec![("/Game/A", package)]);

    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);
    assert_eq!(allocation_cancels.load(Ordering::Relaxed), 1);
}

#[test]
fn cancel_empties_everything() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![
            (
                "/Game/A",
                FakePackage::with_exports(&["Mesh"]).importing("/Game/B"),
            ),
            (
                "/Game/B",
                FakePackage::with_exports(&["Mesh"]).handle_ticks(5),
            ),
            ("/Game/C", FakePackage::default()),
        ],
    );

    let a = fixture.enqueue("/Game/A", 0);
    fixture.loader.tick(Some(GENEROUS_TIME_LIMIT));
    assert_eq!(fixture.active_names().len(), 2);
    fixture.enqueue("/Game/C", 0);
    assert!(fixture.loader.keep_alive_count() > 0);

    fixture.loader.cancel();

    let mut completions = fixture.completions();
    completions.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        completions,
        vec![
            ("/Game/A".to_string(), None, LoadResult::Canceled),
            ("/Game/C".to_string(), None, LoadResult::Canceled),
        ]
    );
    assert!(fixture.loader.active_packages().is_empty());
    assert_eq!(fixture.loader.pending_finalize_count(), 0);
    assert_eq!(fixture.loader.queued_count(), 0);
    assert_eq!(fixture.loader.keep_alive_count(), 0);
    assert!(!fixture.loader.is_loading());

    let package_object = fixture.package_object("/Game/A").unwrap();
    assert!(fixture
        .objects
        .state
        .lock()
        .unwrap()
        .invalidated
        .contains(&package_object));

    // Canceled requests are no longer pending
    fixture.loader.flush(Some(a));

    // The loader is usable afterwards
    fixture.enqueue("/Game/C", 0);
    fixture.loader.flush(None);
    assert_eq!(fixture.completions().last().unwrap().2, LoadResult::Succeeded);
}

#[test]
fn suspend_stops_single_threaded_work() {
    let fixture = Fixture::new(
        LoaderConfig::single_threaded(),
        vec![("/Game/A", FakePackage::default())],
    );

    fixture.loader.suspend();
    fixture.loader.suspend();
    fixture.enqueue("/Game/A", 0);
    fixture.loader.tick(None);
    assert_eq!(fixture.loader.queued_count(), 1);

    fixture.loader.resume();
    fixture.loader.tick(None);
    assert_eq!(fixture.loader.queued_count(), 1);
    assert!(fixture.completions().is_empty());

    fixture.loader.resume();
    assert!(!fixture.loader.is_suspended());
    fixture.loader.flush(None);
    assert_eq!(fixture.completions().len(), 1);
}

#[test]
#[should_panic]
fn resume_without_suspend_panics() {
    let fixture = Fixture::new(LoaderConfig::single_threaded(), vec![]);
    fixture.loader.resume();
}

#[test]
#[should_panic]
fn flush_while_suspended_panics() {
    let fixture = Fixture::new(LoaderConfig::single_threaded(), vec![]);
    fixture.loader.suspend();
    fixture.loader.flush(None);
}

#[test]
fn multithreaded_flush() {
    let fixture = Fixture::new(
        LoaderConfig::default(),
        vec![
            (
                "/Game/A",
                FakePackage::with_exports(&["Mesh", "Material"]).importing("/Game/B"),
            ),
            ("/Game/B", FakePackage::with_exports(&["Mesh"])),
        ],
    );

    let a = fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(Some(a));
    assert_eq!(fixture.completed_names(), vec!["/Game/A"]);

    fixture.loader.flush(None);
    assert!(!fixture.loader.is_loading());
    assert_eq!(fixture.loader.keep_alive_count(), 0);
}

#[test]
fn multithreaded_main_thread_only_post_load() {
    let fixture = Fixture::new(
        LoaderConfig::default(),
        vec![("/Game/A", FakePackage::with_exports(&["Texture", "Mesh"]))],
    );

    fixture.enqueue("/Game/A", 0);
    fixture.loader.flush(None);
    assert_eq!(fixture.completions()[0].2, LoadResult::Succeeded);

    let main_thread = std::thread::current().id();
    let state = fixture.objects.state.lock().unwrap();
    let texture = state.objects_of_class("Texture")[0];
    let mesh = state.objects_of_class("Mesh")[0];
    assert_eq!(state.post_load_thread(texture), Some(main_thread));
    assert_ne!(state.post_load_thread(mesh), Some(main_thread));
    assert!(state.post_load_thread(mesh).is_some());
}

#[test]
fn multithreaded_suspend_and_resume() {
    let fixture = Fixture::new(
        LoaderConfig::default(),
        vec![("/Game/A", FakePackage::with_exports(&["Mesh"]))],
    );

    fixture.loader.suspend();
    fixture.enqueue("/Game/A", 0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(fixture.loader.queued_count(), 1);
    assert!(fixture.loader.active_packages().is_empty());

    fixture.loader.resume();
    fixture.loader.flush(None);
    assert_eq!(fixture.completions().len(), 1);
}

#[test]
fn multithreaded_cancel_interrupts_loading() {
    let fixture = Fixture::new(
        LoaderConfig::default(),
        vec![(
            "/Game/A",
            FakePackage::with_exports(&["Mesh"]).handle_ticks(usize::MAX),
        )],
    );

    fixture.enqueue("/Game/A", 0);
    while fixture.loader.active_packages().is_empty() {
        std::thread::yield_now();
    }

    fixture.loader.cancel();
    assert_eq!(
        fixture.completions(),
        vec![("/Game/A".to_string(), None, LoadResult::Canceled)]
    );
    assert!(!fixture.loader.is_loading());
    assert_eq!(fixture.loader.keep_alive_count(), 0);
}
