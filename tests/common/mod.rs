#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN_SECRET: &str = "admin-secret-for-integration";
pub const PASSWORD: &str = "correct-horse-42";

static UNIQUE: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos(),
        UNIQUE.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

/// 14-digit national id with a valid check digit, unique per `seed`.
pub fn national_id(seed: u32) -> String {
    let first13 = format!("29001010{:05}", seed % 100_000);
    let sum: u32 = first13
        .bytes()
        .enumerate()
        .map(|(i, b)| u32::from(b - b'0') * if i % 2 == 0 { 1 } else { 2 })
        .sum();
    format!("{}{}", first13, (10 - sum % 10) % 10)
}

pub fn phone(seed: u32) -> String {
    format!("0101{:07}", seed % 10_000_000)
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: PathBuf,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Sidecar {
    /// Spawn the daemon with fast hashing and open a fresh workspace.
    pub fn start(prefix: &str) -> Self {
        let exe = env!("CARGO_BIN_EXE_tutord");
        let mut child = Command::new(exe)
            .env("TUTORD_TOKEN_SECRET", "integration-token-secret-0123456789")
            .env("TUTORD_ADMIN_SECRET", ADMIN_SECRET)
            .env("TUTORD_ARGON2_M", "1024")
            .env("TUTORD_ARGON2_T", "1")
            .env("TUTORD_ARGON2_P", "1")
            .env_remove("TUTORD_WORKSPACE")
            .env_remove("TUTORD_DEV_MODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn tutord");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        let mut sc = Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace: temp_dir(prefix),
        };
        let path = sc.workspace.to_string_lossy().to_string();
        sc.ok("workspace.select", json!({ "path": path }), None);
        sc
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        let value = self.request(method, params, token);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Expect a failure and return its error code.
    pub fn fails(&mut self, method: &str, params: Value, token: Option<&str>) -> String {
        let value = self.request(method, params, token);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn admin(&mut self) -> String {
        let session = self.ok("auth.adminLogin", json!({ "secret": ADMIN_SECRET }), None);
        session["token"].as_str().expect("admin token").to_string()
    }

    pub fn login(&mut self, phone: &str) -> String {
        let session = self.ok(
            "auth.login",
            json!({ "phone": phone, "password": PASSWORD }),
            None,
        );
        session["token"].as_str().expect("token").to_string()
    }
}

/// An account created by the administrator, already signed in.
pub struct Member {
    pub account_id: String,
    pub profile_id: String,
    pub phone: String,
    pub token: String,
}

fn create_member(sc: &mut Sidecar, admin: &str, role: &str, seed: u32, profile: Value) -> Member {
    let phone = phone(seed);
    let created = sc.ok(
        "accounts.create",
        json!({
            "name": format!("{} {}", role, seed),
            "phone": phone,
            "password": PASSWORD,
            "role": role,
            "profile": profile,
        }),
        Some(admin),
    );
    let token = sc.login(&phone);
    Member {
        account_id: created["account"]["id"].as_str().expect("account id").to_string(),
        profile_id: created["profileId"].as_str().expect("profile id").to_string(),
        phone,
        token,
    }
}

pub fn teacher(sc: &mut Sidecar, admin: &str, seed: u32) -> Member {
    create_member(
        sc,
        admin,
        "teacher",
        seed,
        json!({ "subjects": ["Mathematics"], "qualification": "BSc" }),
    )
}

pub fn student(sc: &mut Sidecar, admin: &str, seed: u32) -> Member {
    create_member(
        sc,
        admin,
        "student",
        seed,
        json!({ "nationalId": national_id(seed), "grade": "10" }),
    )
}

pub fn guardian(sc: &mut Sidecar, admin: &str, seed: u32) -> Member {
    create_member(sc, admin, "guardian", seed, json!({ "relationship": "mother" }))
}

pub fn class(sc: &mut Sidecar, admin: &str, teacher: &Member, max_students: i64) -> String {
    let created = sc.ok(
        "classes.create",
        json!({
            "name": "Algebra I",
            "subject": "Mathematics",
            "teacherId": teacher.profile_id,
            "maxStudents": max_students,
            "academicYear": "2026/2027",
            "semester": "fall",
            "price": 300.0,
        }),
        Some(admin),
    );
    created["id"].as_str().expect("class id").to_string()
}

pub fn enroll(sc: &mut Sidecar, admin: &str, class_id: &str, student: &Member) {
    sc.ok(
        "classes.enroll",
        json!({ "classId": class_id, "studentId": student.profile_id }),
        Some(admin),
    );
}

pub fn link(sc: &mut Sidecar, admin: &str, guardian: &Member, student: &Member) {
    sc.ok(
        "guardians.linkChild",
        json!({ "guardianId": guardian.profile_id, "studentId": student.profile_id }),
        Some(admin),
    );
}
