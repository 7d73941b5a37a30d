use std::sync::OnceLock;

use crate::schema::{Entity, Field, Schema};
use crate::Key;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Student {
    pub number: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub grades: Vec<Grade>,
}

impl Student {
    pub fn new(number: i64, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_grades(mut self, grades: Vec<Grade>) -> Self {
        self.grades = grades;
        self
    }
}

impl Entity for Student {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Student>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Student", Student::default)
                .field(Field::scalar("number", |s: &Student| &s.number, |s: &mut Student, v| s.number = v))
                .field(Field::scalar("name", |s: &Student| &s.name, |s: &mut Student, v| s.name = v))
                .field(Field::optional("nickname", |s: &Student| &s.nickname, |s: &mut Student, v| s.nickname = v))
                .field(Field::virtual_list::<Grade, _, _>(
                    "grades",
                    "student_id",
                    |s: &Student| &s.grades,
                    |s: &mut Student, v| s.grades = v,
                ))
                .build()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grade {
    pub course: String,
    pub score: f64,
    pub student_id: Option<Key>,
}

impl Grade {
    pub fn new(course: &str, score: f64) -> Self {
        Self {
            course: course.to_string(),
            score,
            student_id: None,
        }
    }
}

impl Entity for Grade {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Grade>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Grade", Grade::default)
                .field(Field::scalar("course", |g: &Grade| &g.course, |g: &mut Grade, v| g.course = v).wire_name("course_name"))
                .field(Field::scalar("score", |g: &Grade| &g.score, |g: &mut Grade, v| g.score = v))
                .field(Field::reference("student_id", |g: &Grade| &g.student_id, |g: &mut Grade, v| g.student_id = v))
                .build()
        })
    }
}
