mod tests {
    use crate::kv::KvStore;
    use crate::runtime::association::{AssociationTable, StoreBinding};
    use crate::runtime::bindings::Host;
    use crate::runtime::context::ScriptContext;
    use crate::runtime::pool::ExecutionContext;
    use crate::runtime::request::RequestState;
    use crate::runtime::ContextId;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        associations: Arc<AssociationTable>,
        context: ScriptContext,
        memory: Arc<KvStore>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(script: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let memory = Arc::new(KvStore::memory().unwrap());
        let disk = Arc::new(KvStore::disk(tmp.path(), true).unwrap());

        let associations = Arc::new(AssociationTable::new());
        let generator = Arc::new(Mutex::new(ulid::Generator::new()));

        let id = ContextId::next();
        let mem_binding = StoreBinding::new(memory.clone());
        let disk_binding = StoreBinding::new(disk.clone());
        associations.update(id, |state| {
            state.memory = Some(mem_binding.clone());
            state.disk = Some(disk_binding.clone());
        });

        let host = Host::new(id, associations.clone(), generator);
        let context = ScriptContext::initialize(host, script).unwrap();

        Fixture {
            associations,
            context,
            memory,
            _tmp: tmp,
        }
    }

    fn bind_request(fixture: &Fixture, request: Arc<RequestState>) {
        fixture
            .associations
            .update(fixture.context.id(), |state| {
                state.request = Some(request.clone());
            });
    }

    fn simple_request(method: &str, path: &str) -> Arc<RequestState> {
        RequestState::new(
            method.to_string(),
            path.to_string(),
            HashMap::new(),
            HashMap::new(),
            String::new(),
            "127.0.0.1".to_string(),
        )
    }

    #[test]
    fn empty_script_initializes() {
        let f = fixture("void 0;");
        assert_eq!(f.context.routes().unwrap().len(), 0);
    }

    #[test]
    fn syntax_error_fails_initialization() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = Arc::new(KvStore::memory().unwrap());
        let disk = Arc::new(KvStore::disk(tmp.path(), true).unwrap());
        let associations = Arc::new(AssociationTable::new());
        let generator = Arc::new(Mutex::new(ulid::Generator::new()));
        let id = ContextId::next();
        associations.update(id, |state| {
            state.memory = Some(StoreBinding::new(memory));
            state.disk = Some(StoreBinding::new(disk));
        });
        let host = Host::new(id, associations, generator);

        assert!(ScriptContext::initialize(host, "this is not valid javascript ))").is_err());
    }

    #[test]
    fn route_sugar_registers_routes() {
        let f = fixture(
            r#"
            pulse.get('/hello', function(req) { return 'hi'; });
            pulse.post('/items', function(req) { return 'created'; });
        "#,
        );

        let mut routes = f.context.routes().unwrap();
        routes.sort();
        assert_eq!(routes, vec!["GET /hello", "POST /items"]);
    }

    #[test]
    fn invoke_returns_handler_result() {
        let f = fixture(r#"pulse.get('/hello', function(req) { return 'hi'; });"#);
        bind_request(&f, simple_request("GET", "/hello"));

        assert_eq!(f.context.invoke("GET /hello").unwrap(), "hi");
    }

    #[test]
    fn invoke_unknown_route_is_an_error() {
        let f = fixture("void 0;");
        bind_request(&f, simple_request("GET", "/missing"));

        assert!(f.context.invoke("GET /missing").is_err());
    }

    #[test]
    fn undefined_handler_result_is_empty_body() {
        let f = fixture(r#"pulse.get('/void', function(req) {});"#);
        bind_request(&f, simple_request("GET", "/void"));

        assert_eq!(f.context.invoke("GET /void").unwrap(), "");
    }

    #[test]
    fn throwing_handler_is_an_error() {
        let f = fixture(r#"pulse.get('/boom', function(req) { throw new Error('boom'); });"#);
        bind_request(&f, simple_request("GET", "/boom"));

        assert!(f.context.invoke("GET /boom").is_err());
    }

    #[test]
    fn request_accessors_reflect_bound_request() {
        let f = fixture(
            r#"
            pulse.get('/echo', function(req) {
                return req.method() + ' ' + req.path()
                    + ' q=' + req.query('name')
                    + ' h=' + req.header('X-Token')
                    + ' b=' + req.body();
            });
        "#,
        );

        let mut query = HashMap::new();
        query.insert("name".to_string(), "pulse".to_string());
        let mut headers = HashMap::new();
        headers.insert("x-token".to_string(), "secret".to_string());
        let request = RequestState::new(
            "GET".to_string(),
            "/echo".to_string(),
            query,
            headers,
            "payload".to_string(),
            "127.0.0.1".to_string(),
        );
        bind_request(&f, request);

        assert_eq!(
            f.context.invoke("GET /echo").unwrap(),
            "GET /echo q=pulse h=secret b=payload"
        );
    }

    #[test]
    fn rebinding_replaces_the_visible_request() {
        let f = fixture(r#"pulse.get('/echo', function(req) { return req.body(); });"#);

        let first = RequestState::new(
            "GET".to_string(),
            "/echo".to_string(),
            HashMap::new(),
            HashMap::new(),
            "first".to_string(),
            "127.0.0.1".to_string(),
        );
        bind_request(&f, first);
        assert_eq!(f.context.invoke("GET /echo").unwrap(), "first");

        let second = RequestState::new(
            "GET".to_string(),
            "/echo".to_string(),
            HashMap::new(),
            HashMap::new(),
            "second".to_string(),
            "127.0.0.1".to_string(),
        );
        bind_request(&f, second);
        assert_eq!(f.context.invoke("GET /echo").unwrap(), "second");
    }

    #[test]
    fn connection_accessors_reflect_bound_request() {
        let f = fixture(
            r#"
            pulse.post('/where', function(req) {
                return req.host() + '|' + req.ip() + '|' + req.protocol()
                    + '|' + req.form('name') + '|' + req.cookie('session');
            });
        "#,
        );

        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "pulse.test".to_string());
        headers.insert("cookie".to_string(), "session=s1".to_string());
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        let request = RequestState::new(
            "POST".to_string(),
            "/where".to_string(),
            HashMap::new(),
            headers,
            "name=ada".to_string(),
            "10.0.0.7".to_string(),
        );
        bind_request(&f, request);

        assert_eq!(
            f.context.invoke("POST /where").unwrap(),
            "pulse.test|10.0.0.7|http|ada|s1"
        );
    }

    #[test]
    fn redirect_sets_status_and_location() {
        let f = fixture(r#"pulse.get('/old', function(req) { req.redirect('/new'); });"#);
        let request = simple_request("GET", "/old");
        bind_request(&f, request.clone());

        f.context.invoke("GET /old").unwrap();

        let response = request.response.lock();
        assert_eq!(response.status, 302);
        assert_eq!(
            response.headers,
            vec![("location".to_string(), "/new".to_string())]
        );
    }

    #[test]
    fn cookie_mutations_land_in_response_headers() {
        let f = fixture(
            r#"
            pulse.get('/cookies', function(req) {
                req.setCookie('session', 's1');
                req.clearCookie('stale');
            });
        "#,
        );
        let request = simple_request("GET", "/cookies");
        bind_request(&f, request.clone());

        f.context.invoke("GET /cookies").unwrap();

        let response = request.response.lock();
        assert_eq!(
            response.headers,
            vec![
                ("set-cookie".to_string(), "session=s1; Path=/".to_string()),
                (
                    "set-cookie".to_string(),
                    "stale=; Path=/; Max-Age=0".to_string()
                ),
            ]
        );
    }

    #[test]
    fn invalid_header_value_is_rejected_in_the_handler() {
        let f = fixture(
            r#"pulse.get('/bad', function(req) { req.setHeader('X-Bad', 'a\r\nb'); });"#,
        );
        let request = simple_request("GET", "/bad");
        bind_request(&f, request.clone());

        assert!(f.context.invoke("GET /bad").is_err());
        // Nothing half-written reaches the response.
        assert!(request.response.lock().headers.is_empty());
    }

    #[test]
    fn set_status_and_header_land_in_response_state() {
        let f = fixture(
            r#"
            pulse.post('/create', function(req) {
                req.setStatus(201);
                req.setHeader('Location', '/items/1');
                return 'created';
            });
        "#,
        );
        let request = simple_request("POST", "/create");
        bind_request(&f, request.clone());

        assert_eq!(f.context.invoke("POST /create").unwrap(), "created");

        let response = request.response.lock();
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers,
            vec![("Location".to_string(), "/items/1".to_string())]
        );
    }

    #[test]
    fn transaction_writes_are_committed() {
        let f = fixture(
            r#"
            pulse.post('/save', function(req) {
                kv.memory.transaction(function(store) {
                    store.set('greeting', 'hello');
                });
                return 'ok';
            });
        "#,
        );
        bind_request(&f, simple_request("POST", "/save"));

        f.context.invoke("POST /save").unwrap();
        assert_eq!(
            f.memory.get(b"greeting").unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[test]
    fn throwing_callback_discards_the_transaction() {
        let f = fixture(
            r#"
            pulse.post('/save', function(req) {
                kv.memory.transaction(function(store) {
                    store.set('greeting', 'hello');
                    throw new Error('abort');
                });
                return 'unreachable';
            });
        "#,
        );
        bind_request(&f, simple_request("POST", "/save"));

        assert!(f.context.invoke("POST /save").is_err());
        assert_eq!(f.memory.get(b"greeting").unwrap(), None);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let f = fixture(
            r#"
            pulse.get('/rw', function(req) {
                var seen = '';
                kv.memory.transaction(function(store) {
                    store.set('k', 'v');
                    seen = store.get('k');
                    store.delete('k');
                    seen += '|' + store.get('k');
                });
                return seen;
            });
        "#,
        );
        bind_request(&f, simple_request("GET", "/rw"));

        assert_eq!(f.context.invoke("GET /rw").unwrap(), "v|");
    }

    #[test]
    fn serial_transaction_commits() {
        let f = fixture(
            r#"
            pulse.post('/save', function(req) {
                kv.disk.serialTransaction(function(store) {
                    store.set('durable', 'yes');
                });
                return kv.disk.get('durable');
            });
        "#,
        );
        bind_request(&f, simple_request("POST", "/save"));

        assert_eq!(f.context.invoke("POST /save").unwrap(), "yes");
    }

    #[test]
    fn snapshot_get_outside_transaction() {
        let f = fixture(
            r#"
            pulse.get('/read', function(req) {
                return 'missing=[' + kv.memory.get('nope') + ']';
            });
        "#,
        );
        bind_request(&f, simple_request("GET", "/read"));

        // Absent keys read as the empty string.
        assert_eq!(f.context.invoke("GET /read").unwrap(), "missing=[]");
    }

    #[test]
    fn store_outside_transaction_is_an_error() {
        let f = fixture("void 0;");
        let binding = f
            .associations
            .get(f.context.id())
            .unwrap()
            .memory
            .clone()
            .unwrap();
        assert!(binding.txn_set(b"k", b"v").is_err());
    }

    #[test]
    fn list_keys_and_pairs_from_script() {
        let f = fixture(
            r#"
            pulse.get('/list', function(req) {
                kv.memory.transaction(function(store) {
                    store.set('user:1', 'ada');
                    store.set('user:2', 'grace');
                    store.set('other', 'x');
                });
                var keys = kv.memory.listKeys('user:', 10);
                var pairs = kv.memory.listPairs('user:', 1);
                return keys.length + '/' + pairs.length + '/' + pairs[0].value;
            });
        "#,
        );
        bind_request(&f, simple_request("GET", "/list"));

        assert_eq!(f.context.invoke("GET /list").unwrap(), "2/1/ada");
    }

    #[test]
    fn ulid_is_monotonic_within_a_context() {
        let f = fixture(
            r#"
            pulse.get('/ids', function(req) {
                var a = pulse.ulid();
                var b = pulse.ulid();
                return (a < b) + ':' + a.length;
            });
        "#,
        );
        bind_request(&f, simple_request("GET", "/ids"));

        assert_eq!(f.context.invoke("GET /ids").unwrap(), "true:26");
    }

    #[test]
    fn context_built_on_another_thread_closes_cleanly() {
        // The runtime's heap is thread-local; creation, invocation, and
        // teardown must work no matter which thread holds the handle.
        let f = std::thread::spawn(|| {
            fixture(r#"pulse.get('/x', function(req) { return 'x'; });"#)
        })
        .join()
        .unwrap();
        bind_request(&f, simple_request("GET", "/x"));

        assert_eq!(f.context.invoke("GET /x").unwrap(), "x");
        f.context.close();
        assert!(f.context.invoke("GET /x").is_err());
    }

    #[test]
    fn closed_context_refuses_invocation() {
        let f = fixture(r#"pulse.get('/x', function(req) { return 'x'; });"#);
        bind_request(&f, simple_request("GET", "/x"));

        f.context.close();
        assert!(f.context.invoke("GET /x").is_err());
    }
}
