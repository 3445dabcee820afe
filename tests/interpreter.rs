//! End-to-end scenarios through the public surface: source in, stdout out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use embr::{EmbrError, Host, Vm};

#[derive(Default)]
struct ScriptedHost {
    modules: HashMap<String, String>,
}

impl Host for ScriptedHost {
    fn clock(&self) -> f64 {
        1.5
    }
    fn time(&self) -> f64 {
        1700000000.0
    }
    fn term(&mut self, _cmd: &str) -> Result<f64, String> {
        Ok(0.0)
    }
    fn load(&mut self, name: &str) -> Result<String, String> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| format!("Failed to load module '{}'.", name))
    }
}

#[derive(Clone, Default)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_with(host: ScriptedHost, src: &str) -> Result<String, EmbrError> {
    let sink = Sink::default();
    let mut vm = Vm::with_output(Box::new(host), Box::new(sink.clone()));
    vm.interpret(src)?;
    let bytes = sink.0.borrow().clone();
    Ok(String::from_utf8(bytes).expect("program output is utf-8"))
}

fn run(src: &str) -> Result<String, EmbrError> {
    run_with(ScriptedHost::default(), src)
}

fn stdout(src: &str) -> String {
    run(src).expect("program should run cleanly")
}

#[test]
fn expression_arithmetic() {
    assert_eq!(stdout("out 1 + 2 * 3;"), "7\n");
}

#[test]
fn closures_capture_mutable_state() {
    let src = "\
fn make(){ var x=0; fn inc(){ x=x+1; return x; } return inc; }
var f=make(); out f(); out f(); out f();
";
    assert_eq!(stdout(src), "1\n2\n3\n");
}

#[test]
fn inheritance_dispatches_through_super() {
    let src = "\
class A{ greet(){ out \"A\"; } }
class B < A { greet(){ super.greet(); out \"B\"; } }
B().greet();
";
    assert_eq!(stdout(src), "A\nB\n");
}

#[test]
fn dict_remove_and_length() {
    let src = "var d = {\"a\": 1, \"b\": 2}; remove(d,\"a\"); out length(d); out d.b;";
    assert_eq!(stdout(src), "1\n2\n");
}

#[test]
fn array_head_tail_length() {
    let src = "var a=[10,20,30]; out head(a); out tail(a); out length(a); out a[0];";
    assert_eq!(stdout(src), "10\n30\n1\n20\n");
}

#[test]
fn declared_return_kind_mismatch_is_a_compile_error() {
    let err = run("fn bad() @int { return \"x\"; } out bad();").unwrap_err();
    let EmbrError::Compile(diagnostics) = &err else {
        panic!("expected a compile error, got {}", err);
    };
    assert!(diagnostics.to_string().contains("Function must return a number."));
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn runtime_errors_carry_a_stack_trace_and_exit_code() {
    let err = run("fn f() { return 1 + \"x\"; }\nf();").unwrap_err();
    assert_eq!(err.exit_code(), 70);
    let text = err.to_string();
    assert!(text.contains("Operands must be two numbers or two strings."));
    assert!(text.contains("[line 1] in f()"));
    assert!(text.contains("[line 2] in script"));
}

#[test]
fn compile_errors_report_line_and_lexeme() {
    let err = run("out 1").unwrap_err();
    assert_eq!(err.to_string(), "[line 1] Error at end: Expect ';' after value.");
}

#[test]
fn imports_compile_and_run_before_the_importer_continues() {
    let mut host = ScriptedHost::default();
    host.modules.insert(
        "list_utils".to_string(),
        "fn sum(a) { var total = 0; for (var i = 0; i < length(a); i = i + 1) { total = total + a[i]; } return total; }".to_string(),
    );
    let src = "import list_utils\nout sum([1, 2, 3, 4]);";
    assert_eq!(run_with(host, src).unwrap(), "10\n");
}

#[test]
fn host_clocks_are_consumed_as_opaque_services() {
    assert_eq!(stdout("out clock(); out time();"), "1.5\n1700000000\n");
}

#[test]
fn state_survives_between_interprets_on_one_vm() {
    let sink = Sink::default();
    let mut vm = Vm::with_output(Box::new(ScriptedHost::default()), Box::new(sink.clone()));
    vm.interpret("var hits = 0;").unwrap();
    vm.interpret("hits = hits + 1;").unwrap();
    vm.interpret("out hits;").unwrap();
    assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "1\n");
}

#[test]
fn vm_recovers_after_a_runtime_error() {
    let sink = Sink::default();
    let mut vm = Vm::with_output(Box::new(ScriptedHost::default()), Box::new(sink.clone()));
    assert!(vm.interpret("out missing;").is_err());
    vm.interpret("out 1;").unwrap();
    assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "1\n");
}
